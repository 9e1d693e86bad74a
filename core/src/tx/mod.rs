//! Transmit side: packets, queue, timer and scheduler

pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod timer;

pub use policy::{
    compute_wait_ms, poll_response_delay, validate_payload, OutboundPacket, PacketId, RepeatCount,
    TimingPolicy, CONTROL_INTERVAL_MS, MAX_PAYLOAD_LEN,
};
pub use queue::TxQueue;
pub use scheduler::{CancelOutcome, TxAction, TxScheduler};
pub use timer::TxTimer;
