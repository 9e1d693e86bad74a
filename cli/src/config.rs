// Configuration management for the meshio CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshio/config.json
// - Linux: ~/.config/meshio/config.json
// - Windows: %APPDATA%\meshio\config.json

use anyhow::{Context, Result};
use meshio_core::{BurstMode, MeshIoConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mesh I/O settings handed to the core
    pub mesh: MeshIoConfig,

    /// Defaults for `meshio simulate`
    pub simulation: SimulationConfig,

    /// Also write logs to this file
    pub log_file: Option<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Virtual time to simulate, in milliseconds
    pub duration_ms: u32,

    /// Radio index reported to the core
    pub radio_index: u16,

    /// Seed for the virtual controller's address generator
    pub controller_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh: MeshIoConfig::default(),
            simulation: SimulationConfig::default(),
            log_file: None,
            path: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: 2000,
            radio_index: 0,
            controller_seed: 1,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshio");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or create a default one there
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            Config::default()
        };
        config.path = Some(path.to_path_buf());
        if !path.exists() {
            config.save()?;
        }
        config
            .mesh
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(config)
    }

    /// Save config to the file it was loaded from
    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => Self::config_file()?,
        };
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "burst_mode" => {
                updated.mesh.burst_mode = value.parse::<BurstMode>()?;
            }
            "max_filters" => {
                updated.mesh.max_filters = value.parse().context("Invalid number")?;
            }
            "window_accuracy_ms" => {
                updated.mesh.window_accuracy_ms = value.parse().context("Invalid number")?;
            }
            "control_interval_ms" => {
                updated.mesh.control_interval_ms = value.parse().context("Invalid number")?;
            }
            "vendor_adv_stats" => {
                updated.mesh.vendor_adv_stats = value.parse().context("Invalid boolean value")?;
            }
            "stuck_burst_timeout_ms" => {
                updated.mesh.stuck_burst_timeout_ms = parse_optional(value)?;
            }
            "rng_seed" => {
                updated.mesh.rng_seed = parse_optional(value)?;
            }
            "command_channel_size" => {
                updated.mesh.command_channel_size = value.parse().context("Invalid number")?;
            }
            "duration_ms" => {
                updated.simulation.duration_ms = value.parse().context("Invalid number")?;
            }
            "radio_index" => {
                updated.simulation.radio_index = value.parse().context("Invalid number")?;
            }
            "controller_seed" => {
                updated.simulation.controller_seed = value.parse().context("Invalid number")?;
            }
            "log_file" => {
                updated.log_file = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.mesh.validate()?;
        *self = updated;
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        vec![
            ("burst_mode".to_string(), mesh.burst_mode.to_string()),
            ("max_filters".to_string(), mesh.max_filters.to_string()),
            ("window_accuracy_ms".to_string(), mesh.window_accuracy_ms.to_string()),
            ("control_interval_ms".to_string(), mesh.control_interval_ms.to_string()),
            ("vendor_adv_stats".to_string(), mesh.vendor_adv_stats.to_string()),
            ("stuck_burst_timeout_ms".to_string(), format_optional(mesh.stuck_burst_timeout_ms)),
            ("rng_seed".to_string(), format_optional(mesh.rng_seed)),
            ("command_channel_size".to_string(), mesh.command_channel_size.to_string()),
            ("duration_ms".to_string(), self.simulation.duration_ms.to_string()),
            ("radio_index".to_string(), self.simulation.radio_index.to_string()),
            ("controller_seed".to_string(), self.simulation.controller_seed.to_string()),
            (
                "log_file".to_string(),
                self.log_file.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
        ]
    }
}

fn parse_optional<T: std::str::FromStr>(value: &str) -> Result<Option<T>> {
    match value {
        "" | "off" | "none" => Ok(None),
        v => v
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid number: {}", v)),
    }
}

fn format_optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "off".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mesh.burst_mode, BurstMode::Chained);
        assert_eq!(config.simulation.duration_ms, 2000);
        assert_eq!(config.get("stuck_burst_timeout_ms").as_deref(), Some("off"));
    }

    #[test]
    fn test_load_creates_and_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        config.set("burst_mode", "sync").unwrap();
        config.set("stuck_burst_timeout_ms", "1000").unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.mesh.burst_mode, BurstMode::Synchronous);
        assert_eq!(reloaded.mesh.stuck_burst_timeout_ms, Some(1000));
    }

    #[test]
    fn test_invalid_value_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::load_from(&path).unwrap();

        assert!(config.set("max_filters", "0").is_err());
        assert!(config.set("nonsense", "1").is_err());
        assert_eq!(config.mesh.max_filters, 255);
        assert_eq!(Config::load_from(&path).unwrap().mesh.max_filters, 255);
    }
}
