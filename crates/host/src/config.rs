//! Host configuration management

use crate::usb::{DriverConfig, EventTaskConfig, Timeouts};
use common::{Error, Result};
use msc_proto::MscEvent;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub event_task: EventTaskSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Driver timeouts and buffer sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Bulk and control transfer timeout
    #[serde(default = "DriverSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Total time a unit may take to become ready during install
    #[serde(default = "DriverSettings::default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "DriverSettings::default_ready_poll_ms")]
    pub ready_poll_ms: u64,
    /// Per-device transfer buffer, before rounding to the bulk IN packet size
    #[serde(default = "DriverSettings::default_transfer_buffer_size")]
    pub transfer_buffer_size: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            ready_timeout_ms: Self::default_ready_timeout_ms(),
            ready_poll_ms: Self::default_ready_poll_ms(),
            transfer_buffer_size: Self::default_transfer_buffer_size(),
        }
    }
}

impl DriverSettings {
    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_ready_timeout_ms() -> u64 {
        3000
    }

    fn default_ready_poll_ms() -> u64 {
        100
    }

    fn default_transfer_buffer_size() -> usize {
        crate::usb::DEFAULT_TRANSFER_BUFFER_SIZE
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            transfer: Duration::from_millis(self.transfer_timeout_ms),
            ready_budget: Duration::from_millis(self.ready_timeout_ms),
            ready_poll: Duration::from_millis(self.ready_poll_ms),
        }
    }
}

/// Background dispatch thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTaskSettings {
    /// When disabled the host pumps events from its own thread
    #[serde(default = "EventTaskSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "EventTaskSettings::default_stack_size")]
    pub stack_size: usize,
    #[serde(default = "EventTaskSettings::default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub core_id: Option<usize>,
}

impl Default for EventTaskSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            stack_size: Self::default_stack_size(),
            priority: Self::default_priority(),
            core_id: None,
        }
    }
}

impl EventTaskSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_stack_size() -> usize {
        EventTaskConfig::default().stack_size
    }

    fn default_priority() -> u32 {
        EventTaskConfig::default().priority
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Restrict to one bus (all buses when unset)
    #[serde(default)]
    pub bus: Option<u8>,
    /// Install every mass storage device as it connects
    #[serde(default = "UsbSettings::default_auto_install")]
    pub auto_install: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            bus: None,
            auto_install: Self::default_auto_install(),
        }
    }
}

impl UsbSettings {
    fn default_auto_install() -> bool {
        true
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the first standard location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("no configuration file found".to_string()))?,
        };

        let content = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "failed to parse {}: {}",
                config_path.display(),
                e
            ))
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize configuration: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-msc").join("host.toml")
        } else {
            PathBuf::from(".config/usb-msc/host.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![Self::default_path(), PathBuf::from("/etc/usb-msc/host.toml")]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(Error::Config(format!(
                "invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            )));
        }

        let timeouts = [
            ("transfer_timeout_ms", self.driver.transfer_timeout_ms),
            ("ready_timeout_ms", self.driver.ready_timeout_ms),
            ("ready_poll_ms", self.driver.ready_poll_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }

        if self.driver.transfer_buffer_size == 0 {
            return Err(Error::Config(
                "transfer_buffer_size must be non-zero".to_string(),
            ));
        }

        if self.event_task.enabled
            && (self.event_task.stack_size == 0 || self.event_task.priority == 0)
        {
            return Err(Error::Config(
                "event task stack_size and priority must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Driver configuration for these settings
    pub fn driver_config(
        &self,
        callback: impl Fn(&MscEvent) + Send + Sync + 'static,
    ) -> DriverConfig {
        let event_task = self.event_task.enabled.then(|| EventTaskConfig {
            stack_size: self.event_task.stack_size,
            priority: self.event_task.priority,
            core_id: self.event_task.core_id,
        });

        DriverConfig::new(callback)
            .with_event_task(event_task)
            .with_timeouts(self.driver.timeouts())
            .with_transfer_buffer_size(self.driver.transfer_buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.driver.transfer_timeout_ms, 5000);
        assert_eq!(config.driver.transfer_buffer_size, 64);
        assert!(config.event_task.enabled);
        assert!(config.usb.auto_install);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_timeouts_match_driver() {
        assert_eq!(AppConfig::default().driver.timeouts(), Timeouts::default());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = AppConfig::default();
        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.host.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = AppConfig::default();
        config.driver.ready_poll_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.driver.transfer_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.event_task.priority = 0;
        assert!(config.validate().is_err());
        config.event_task.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_driver_config_without_task() {
        let mut config = AppConfig::default();
        config.event_task.enabled = false;
        let driver = config.driver_config(|_| {});
        assert!(driver.event_task.is_none());
        assert!(driver.callback.is_some());
    }
}
