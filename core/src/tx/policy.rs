//! Outbound packets and their timing policies

use crate::config::ConfigError;
use crate::hci::command::AdvData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest payload carried by one advertising data unit: 31 bytes of data
/// minus the AD length prefix.
pub const MAX_PAYLOAD_LEN: usize = 30;

/// Advertising interval used for poll and poll-response transmissions
pub const CONTROL_INTERVAL_MS: u16 = 25;

/// A poll-response whose deadline is further away than this fires at once
pub const MAX_POLL_RESPONSE_DELAY_MS: u32 = 255;

/// Identifier assigned to a packet when it is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Number of transmissions of a `General` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    Unlimited,
    Times(u8),
}

/// When and how often a packet goes on air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimingPolicy {
    /// First transmission after a random delay in `[min_delay, max_delay)`,
    /// then every `interval` ms, `count` times
    General {
        min_delay: u16,
        max_delay: u16,
        interval: u16,
        count: RepeatCount,
    },
    /// Single transmission after a random delay in `[min_delay, max_delay)`
    Poll { min_delay: u16, max_delay: u16 },
    /// Single transmission at `instant + delay`; jumps the queue
    PollResponse { instant: u32, delay: u16 },
}

impl TimingPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            TimingPolicy::General {
                min_delay,
                max_delay,
                interval,
                count,
            } => {
                if count == RepeatCount::Times(0) {
                    return Err(ConfigError::ZeroRepeatCount);
                }
                if interval == 0 {
                    return Err(ConfigError::ZeroInterval);
                }
                check_delay_range(min_delay, max_delay)
            }
            TimingPolicy::Poll {
                min_delay,
                max_delay,
            } => check_delay_range(min_delay, max_delay),
            TimingPolicy::PollResponse { .. } => Ok(()),
        }
    }

    pub fn is_poll_response(&self) -> bool {
        matches!(self, TimingPolicy::PollResponse { .. })
    }

    /// Delay window for the first transmission, if the policy has one
    pub fn delay_range(&self) -> Option<(u16, u16)> {
        match *self {
            TimingPolicy::General {
                min_delay,
                max_delay,
                ..
            }
            | TimingPolicy::Poll {
                min_delay,
                max_delay,
            } => Some((min_delay, max_delay)),
            TimingPolicy::PollResponse { .. } => None,
        }
    }
}

fn check_delay_range(min: u16, max: u16) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidDelayRange { min, max });
    }
    Ok(())
}

/// Check an outbound payload fits one advertising data unit
pub fn validate_payload(payload: &[u8]) -> Result<(), ConfigError> {
    if payload.is_empty() {
        return Err(ConfigError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ConfigError::PayloadTooLong(payload.len()));
    }
    Ok(())
}

/// A packet waiting in (or cycling through) the transmit queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub id: PacketId,
    pub policy: TimingPolicy,
    /// Payload already framed as advertising data
    pub data: AdvData,
    /// Set once the packet is on its final transmission
    pub delete_after_send: bool,
}

impl OutboundPacket {
    pub fn new(id: PacketId, policy: TimingPolicy, payload: &[u8]) -> Result<Self, ConfigError> {
        policy.validate()?;
        validate_payload(payload)?;
        let data = AdvData::from_packet(payload).ok_or(ConfigError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            id,
            policy,
            data,
            delete_after_send: false,
        })
    }

    /// Mesh packet bytes: AD type followed by the AD payload
    pub fn payload(&self) -> &[u8] {
        &self.data.as_bytes()[1..]
    }

    pub fn ad_type(&self) -> u8 {
        self.payload()[0]
    }

    /// Cancel-pattern match: a single byte selects by AD type (`0x00` matches
    /// every packet), longer patterns match a payload prefix.
    pub fn matches(&self, pattern: &[u8]) -> bool {
        match pattern {
            [] => false,
            [ad_type] => *ad_type == 0 || *ad_type == self.ad_type(),
            prefix => self.payload().starts_with(prefix),
        }
    }
}

/// Milliseconds from `now` until `instant + delay`. A deadline already in
/// the past yields 0. Instants wrap at 2^32 ms.
pub fn compute_wait_ms(instant: u32, delay: u16, now: u32) -> u32 {
    let deadline = instant.wrapping_add(delay as u32);
    let remaining = deadline.wrapping_sub(now) as i32;
    remaining.max(0) as u32
}

/// Initial delay of a poll response. Deadlines more than 255 ms away, which
/// includes deadlines already passed once the difference wraps, fire at once.
pub fn poll_response_delay(instant: u32, delay: u16, now: u32) -> u32 {
    let remaining = instant.wrapping_add(delay as u32).wrapping_sub(now);
    if remaining > MAX_POLL_RESPONSE_DELAY_MS {
        0
    } else {
        remaining
    }
}
