//! Mesh I/O configuration

use crate::tx::CONTROL_INTERVAL_MS;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bad filter, payload or parameters. The rejected operation has no effect.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Payload must not be empty")]
    EmptyPayload,

    #[error("Payload too long: {0} bytes (max 30)")]
    PayloadTooLong(usize),

    #[error("Repeat count must be at least 1")]
    ZeroRepeatCount,

    #[error("Repeat interval must be greater than 0")]
    ZeroInterval,

    #[error("Minimum delay {min} ms exceeds maximum delay {max} ms")]
    InvalidDelayRange { min: u16, max: u16 },

    #[error("Invalid receive filter: {0}")]
    InvalidFilter(String),

    #[error("Cancel pattern must not be empty")]
    EmptyPattern,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How advertising bursts are issued to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstMode {
    /// One command per completion event
    #[default]
    Chained,
    /// All four commands written back to back with blocking writes
    Synchronous,
}

impl std::str::FromStr for BurstMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chained" | "async" => Ok(BurstMode::Chained),
            "synchronous" | "sync" => Ok(BurstMode::Synchronous),
            other => Err(ConfigError::Invalid(format!("unknown burst mode '{}'", other))),
        }
    }
}

impl std::fmt::Display for BurstMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BurstMode::Chained => write!(f, "chained"),
            BurstMode::Synchronous => write!(f, "synchronous"),
        }
    }
}

/// Mesh I/O configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshIoConfig {
    pub burst_mode: BurstMode,
    /// Receive filters accepted at once
    pub max_filters: usize,
    /// Scan window accuracy reported in capabilities
    pub window_accuracy_ms: u16,
    /// Advertising interval for poll and poll-response packets
    pub control_interval_ms: u16,
    /// Issue the vendor advertising statistics command before repeated bursts
    pub vendor_adv_stats: bool,
    /// Release a burst that never completes after this long; off when `None`
    pub stuck_burst_timeout_ms: Option<u32>,
    /// Seed for transmit jitter; entropy when `None`
    pub rng_seed: Option<u64>,
    /// Capacity of the service command channel
    pub command_channel_size: usize,
}

impl Default for MeshIoConfig {
    fn default() -> Self {
        Self {
            burst_mode: BurstMode::default(),
            max_filters: 255,
            window_accuracy_ms: 50,
            control_interval_ms: CONTROL_INTERVAL_MS,
            vendor_adv_stats: false,
            stuck_burst_timeout_ms: None,
            rng_seed: None,
            command_channel_size: 256,
        }
    }
}

impl MeshIoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_filters == 0 {
            return Err(ConfigError::Invalid(
                "max_filters must be greater than 0".to_string(),
            ));
        }
        if self.control_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "control_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.stuck_burst_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "stuck_burst_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.command_channel_size == 0 {
            return Err(ConfigError::Invalid(
                "command_channel_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshIoConfig::default();
        assert_eq!(config.burst_mode, BurstMode::Chained);
        assert_eq!(config.max_filters, 255);
        assert_eq!(config.window_accuracy_ms, 50);
        assert_eq!(config.control_interval_ms, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = MeshIoConfig {
            max_filters: 0,
            ..MeshIoConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MeshIoConfig {
            stuck_burst_timeout_ms: Some(0),
            ..MeshIoConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshIoConfig =
            serde_json::from_str(r#"{"burst_mode":"synchronous","rng_seed":9}"#).unwrap();
        assert_eq!(config.burst_mode, BurstMode::Synchronous);
        assert_eq!(config.rng_seed, Some(9));
        assert_eq!(config.max_filters, 255);
    }

    #[test]
    fn test_burst_mode_parse() {
        assert_eq!("sync".parse::<BurstMode>(), Ok(BurstMode::Synchronous));
        assert_eq!("Chained".parse::<BurstMode>(), Ok(BurstMode::Chained));
        assert!("bogus".parse::<BurstMode>().is_err());
    }
}
