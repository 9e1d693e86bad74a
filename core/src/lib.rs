// Mesh I/O: BLE advertising bearer for mesh packets
//
// Schedules outbound mesh packets as non-connectable advertising bursts on an
// HCI controller, and delivers received advertising data to the receivers
// whose filters match it.

pub mod adv;
pub mod config;
pub mod hci;
pub mod io;
pub mod rx;
pub mod service;
pub mod tx;

use thiserror::Error;

pub use adv::{decode_adv_report, DecodeError, RecvField, RecvInfo};
pub use config::{BurstMode, ConfigError, MeshIoConfig};
pub use hci::{HciTransport, TransportError, VirtualController};
pub use io::{Capabilities, Lifecycle, MeshIo, ReadyCallback};
pub use rx::{AdvReceiver, RegistryError, ScanChange};
pub use service::{spawn_mesh_io, MeshClock, MeshIoHandle};
pub use tx::{PacketId, RepeatCount, TimingPolicy};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshIoError {
    #[error("Invalid request: {0}")]
    Config(#[from] ConfigError),
    #[error("Not initialized")]
    NotInitialized,
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Radio error: {0}")]
    Radio(#[from] TransportError),
    #[error("Mesh I/O service stopped")]
    ServiceStopped,
}

impl From<RegistryError> for MeshIoError {
    fn from(err: RegistryError) -> Self {
        MeshIoError::Config(ConfigError::InvalidFilter(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_are_config_errors() {
        let err: MeshIoError = RegistryError::TooManyFilters(255).into();
        assert_eq!(
            err,
            MeshIoError::Config(ConfigError::InvalidFilter(
                "Too many receive filters (max 255)".to_string()
            ))
        );
    }

    #[test]
    fn test_error_display() {
        let err = MeshIoError::from(ConfigError::EmptyPayload);
        assert_eq!(err.to_string(), "Invalid request: Payload must not be empty");
        assert_eq!(MeshIoError::NotInitialized.to_string(), "Not initialized");
    }
}
