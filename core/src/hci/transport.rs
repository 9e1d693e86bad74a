//! Radio transport abstraction
//!
//! The physical HCI driver lives outside this crate. It accepts commands,
//! reports controller events to one registered handler and supplies
//! randomness for address rotation.

use super::command::HciCommand;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Callback receiving raw controller events (`[code][len][params]`)
pub type EventHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Errors reported by a radio transport
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Write would block")]
    WouldBlock,

    #[error("Write interrupted")]
    Interrupted,

    #[error("Radio not available: {0}")]
    NotAvailable(String),

    #[error("Transport I/O error: {0}")]
    Io(String),

    #[error("Command queue full")]
    QueueFull,
}

impl TransportError {
    /// Errors a blocking writer may retry immediately
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::WouldBlock | TransportError::Interrupted)
    }
}

/// Interface to the HCI radio driver
pub trait HciTransport: Send + Sync {
    /// Queue a command. Its completion arrives later as a Command Complete
    /// (or Command Status) event through the registered handler, in
    /// submission order for a given opcode.
    fn submit(&self, command: &HciCommand) -> Result<(), TransportError>;

    /// Write a command packet straight to the controller, returning once the
    /// write has been accepted.
    fn write_blocking(&self, command: &HciCommand) -> Result<(), TransportError>;

    /// Install the handler for controller events. Replaces any previous handler.
    fn register_event_handler(&self, handler: EventHandler);

    /// Fill `buf` with random bytes
    fn random_bytes(&self, buf: &mut [u8]);
}
