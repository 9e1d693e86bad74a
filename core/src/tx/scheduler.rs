//! Transmit scheduler
//!
//! Owns the transmit queue and decides when the next packet goes on air.
//! The scheduler never touches the radio: it hands [`TxAction`]s to its
//! owner, which feeds them to the advertising pipeline.
//!
//! Timing model:
//! - The first packet of an idle queue waits for its policy's initial delay
//!   (random in `[min_delay, max_delay)`, or until a poll response deadline).
//! - Each timer expiry transmits the queue head. Repeating packets rotate to
//!   the tail, the timer is re-armed for the transmitted packet's interval.
//! - An empty queue at expiry stops advertising.

use super::policy::{
    compute_wait_ms, poll_response_delay, OutboundPacket, PacketId, RepeatCount, TimingPolicy,
};
use super::queue::TxQueue;
use super::timer::TxTimer;
use crate::config::{ConfigError, MeshIoConfig};
use crate::hci::pipeline::{AdvBurst, AdvStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

/// What the owner should do with the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAction {
    Transmit(AdvBurst),
    StopAdvertising,
}

/// Result of a cancel request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub removed: Vec<PacketId>,
    /// The queue is now empty and advertising should stop
    pub stop_advertising: bool,
}

#[derive(Debug)]
pub struct TxScheduler {
    queue: TxQueue,
    timer: TxTimer,
    in_flight: Option<PacketId>,
    in_flight_since: u32,
    next_id: u64,
    rng: StdRng,
    control_interval_ms: u16,
    vendor_adv_stats: bool,
    stuck_burst_timeout_ms: Option<u32>,
    adv_seqn: u32,
}

impl Default for TxScheduler {
    fn default() -> Self {
        Self::new(&MeshIoConfig::default())
    }
}

impl TxScheduler {
    pub fn new(config: &MeshIoConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            queue: TxQueue::new(),
            timer: TxTimer::new(),
            in_flight: None,
            in_flight_since: 0,
            next_id: 1,
            rng,
            control_interval_ms: config.control_interval_ms,
            vendor_adv_stats: config.vendor_adv_stats,
            stuck_burst_timeout_ms: config.stuck_burst_timeout_ms,
            adv_seqn: 0,
        }
    }

    /// Queue a packet. Poll responses go to the head; everything else is
    /// appended. An idle scheduler gets a scheduling pass right away.
    pub fn enqueue(&mut self, policy: TimingPolicy, payload: &[u8]) -> Result<PacketId, ConfigError> {
        let id = PacketId(self.next_id);
        let packet = OutboundPacket::new(id, policy, payload)?;
        self.next_id += 1;

        let busy = if policy.is_poll_response() {
            false
        } else {
            self.in_flight.is_some() || !self.queue.is_empty()
        };

        trace!("Queued packet {} ({:?}), busy={}", id, policy, busy);
        self.queue.push(packet);

        if !busy {
            self.timer.cancel();
            self.timer.schedule_immediate();
        }
        Ok(id)
    }

    /// Schedule the queue head after its initial delay. A zero delay
    /// transmits immediately.
    pub fn run_worker(&mut self, now: u32) -> Option<TxAction> {
        let head = self.queue.peek()?;

        let delay = match head.policy {
            TimingPolicy::PollResponse { instant, delay } => poll_response_delay(instant, delay, now),
            policy => {
                let (min, max) = policy.delay_range().unwrap_or((0, 0));
                if min >= max {
                    min as u32
                } else {
                    self.rng.gen_range(min..max) as u32
                }
            }
        };

        self.timer.create(now, delay);
        if delay == 0 {
            self.timer.fire(now);
            return Some(self.on_timer_fire(now));
        }
        trace!("First transmission of packet {} in {} ms", head.id, delay);
        None
    }

    /// Timer expiry: transmit the queue head and re-arm
    pub fn on_timer_fire(&mut self, now: u32) -> TxAction {
        let Some(mut packet) = self.queue.pop() else {
            debug!("Transmit queue empty, stopping advertising");
            self.timer.cancel();
            return TxAction::StopAdvertising;
        };

        let (interval, count) = match &mut packet.policy {
            TimingPolicy::General {
                interval, count, ..
            } => {
                let before = *count;
                if let RepeatCount::Times(n) = count {
                    *n = n.saturating_sub(1);
                }
                (*interval, before)
            }
            _ => (self.control_interval_ms, RepeatCount::Times(1)),
        };

        packet.delete_after_send = count == RepeatCount::Times(1);
        let stats = self.next_stats(count);

        let burst = AdvBurst {
            packet_id: packet.id,
            interval_ms: interval,
            data: packet.data.clone(),
            stats,
        };
        self.in_flight = Some(packet.id);
        self.in_flight_since = now;

        let mut wait = interval as u32;
        if packet.delete_after_send {
            trace!("Last transmission of packet {}", packet.id);
            // A poll response waiting at the head has its own deadline
            if let Some(TimingPolicy::PollResponse { instant, delay }) =
                self.queue.peek().map(|p| p.policy)
            {
                wait = compute_wait_ms(instant, delay, now);
            }
        } else {
            self.queue.push_back(packet);
        }

        self.timer.modify(now, wait);
        TxAction::Transmit(burst)
    }

    fn next_stats(&mut self, count: RepeatCount) -> Option<AdvStats> {
        if !self.vendor_adv_stats {
            return None;
        }
        match count {
            RepeatCount::Times(n) if n > 1 => {
                self.adv_seqn = self.adv_seqn.wrapping_add(1);
                Some(AdvStats {
                    seqn: self.adv_seqn,
                    count: n as u32,
                })
            }
            _ => None,
        }
    }

    /// Remove queued packets matching `pattern`
    pub fn cancel_matching(&mut self, pattern: &[u8]) -> Result<CancelOutcome, ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }

        let removed = self.queue.remove_matching(pattern);
        if let Some(id) = self.in_flight {
            if removed.contains(&id) {
                self.in_flight = None;
            }
        }
        if !removed.is_empty() {
            debug!("Cancelled {} packet(s) matching {}", removed.len(), hex::encode(pattern));
        }

        let stop_advertising = self.queue.is_empty();
        if stop_advertising {
            self.timer.cancel();
        }
        Ok(CancelOutcome {
            removed,
            stop_advertising,
        })
    }

    /// The pipeline finished (or gave up on) the burst for `id`
    pub fn burst_finished(&mut self, id: PacketId) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
    }

    /// Whether `tick` has something to do at `now`
    pub fn has_work(&self, now: u32) -> bool {
        self.timer.worker_pending() || self.timer.is_due(now) || self.watchdog_due(now)
    }

    /// Run whatever is due at `now`; at most one action per call
    pub fn tick(&mut self, now: u32) -> Option<TxAction> {
        if self.watchdog_due(now) {
            self.release_stuck_burst();
        }
        if self.timer.take_worker() {
            if let Some(action) = self.run_worker(now) {
                return Some(action);
            }
        }
        if self.timer.fire(now) {
            return Some(self.on_timer_fire(now));
        }
        None
    }

    /// Earliest armed deadline (timer or watchdog)
    pub fn next_deadline(&self) -> Option<u32> {
        let watchdog = match (self.in_flight, self.stuck_burst_timeout_ms) {
            (Some(_), Some(timeout)) => Some(self.in_flight_since.wrapping_add(timeout)),
            _ => None,
        };
        match (self.timer.deadline(), watchdog) {
            (Some(a), Some(b)) => Some(if (b.wrapping_sub(a) as i32) < 0 { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    fn watchdog_due(&self, now: u32) -> bool {
        match (self.in_flight, self.stuck_burst_timeout_ms) {
            (Some(_), Some(timeout)) => now.wrapping_sub(self.in_flight_since) >= timeout,
            _ => false,
        }
    }

    fn release_stuck_burst(&mut self) {
        if let Some(id) = self.in_flight.take() {
            warn!("Burst for packet {} never completed, releasing it", id);
            if !self.queue.is_empty() {
                self.timer.cancel();
                self.timer.schedule_immediate();
            }
        }
    }

    /// Drop everything: queue, timer and in-flight marker
    pub fn clear(&mut self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Dropped {} queued packet(s)", dropped);
        }
        self.timer.reset();
        self.in_flight = None;
    }

    pub fn in_flight(&self) -> Option<PacketId> {
        self.in_flight
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    pub fn timer(&self) -> &TxTimer {
        &self.timer
    }

    /// Queue non-empty or timer running
    pub fn is_active(&self) -> bool {
        !self.queue.is_empty() || self.timer.is_armed() || self.timer.worker_pending()
    }

    pub fn adv_seqn(&self) -> u32 {
        self.adv_seqn
    }
}
