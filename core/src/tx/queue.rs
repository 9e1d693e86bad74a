//! Transmit queue
//!
//! FIFO, except that poll responses go to the head: a response to a
//! friend poll has a deadline and must not wait behind regular traffic.

use super::policy::{OutboundPacket, PacketId};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct TxQueue {
    packets: VecDeque<OutboundPacket>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: OutboundPacket) {
        if packet.policy.is_poll_response() {
            self.packets.push_front(packet);
        } else {
            self.packets.push_back(packet);
        }
    }

    /// Re-queue a repeating packet after a transmission
    pub fn push_back(&mut self, packet: OutboundPacket) {
        self.packets.push_back(packet);
    }

    pub fn pop(&mut self) -> Option<OutboundPacket> {
        self.packets.pop_front()
    }

    pub fn peek(&self) -> Option<&OutboundPacket> {
        self.packets.front()
    }

    /// Remove every packet matching the cancel pattern, returning their ids
    pub fn remove_matching(&mut self, pattern: &[u8]) -> Vec<PacketId> {
        let mut removed = Vec::new();
        self.packets.retain(|p| {
            if p.matches(pattern) {
                removed.push(p.id);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.packets.iter().any(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.packets.len();
        self.packets.clear();
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundPacket> {
        self.packets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::policy::{RepeatCount, TimingPolicy};

    fn packet(id: u64, policy: TimingPolicy, payload: &[u8]) -> OutboundPacket {
        OutboundPacket::new(PacketId(id), policy, payload).unwrap()
    }

    fn general() -> TimingPolicy {
        TimingPolicy::General {
            min_delay: 0,
            max_delay: 0,
            interval: 100,
            count: RepeatCount::Times(1),
        }
    }

    fn poll_response() -> TimingPolicy {
        TimingPolicy::PollResponse {
            instant: 0,
            delay: 10,
        }
    }

    #[test]
    fn test_poll_response_jumps_queue() {
        let mut queue = TxQueue::new();
        queue.push(packet(1, general(), &[0x2a, 1]));
        queue.push(packet(2, general(), &[0x2a, 2]));
        queue.push(packet(3, poll_response(), &[0x2a, 3]));
        queue.push(packet(4, general(), &[0x2a, 4]));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|p| p.id.0).collect();
        assert_eq!(order, vec![3, 1, 2, 4]);
    }

    #[test]
    fn test_remove_matching_by_type_and_prefix() {
        let mut queue = TxQueue::new();
        queue.push(packet(1, general(), &[0x2a, 1]));
        queue.push(packet(2, general(), &[0x2b, 0x01, 0x02]));
        queue.push(packet(3, general(), &[0x2b, 0x00]));

        assert_eq!(queue.remove_matching(&[0x2b, 0x01]), vec![PacketId(2)]);
        assert_eq!(queue.remove_matching(&[0x2a]), vec![PacketId(1)]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove_matching(&[0x00]), vec![PacketId(3)]);
        assert!(queue.is_empty());
    }
}
