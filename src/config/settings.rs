use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::commands::LASER_SETTLE;
use crate::device::{DeviceError, Result};
use crate::serial::interface::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};

/// Supervisor settings. Every field has a default, so a partial JSON file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub baud_rate: u32,
    /// Window for a single reply from the board.
    pub serial_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub laser_settle_ms: u64,
    /// How long a command waits for the poller to release the device.
    pub command_acquire_timeout_ms: u64,
    /// Upper bound on waiting for the poller to acknowledge a stop.
    pub stop_timeout_ms: u64,
    /// Telemetry events buffered for a slow consumer before new ones are dropped.
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            serial_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: 2000,
            laser_settle_ms: LASER_SETTLE.as_millis() as u64,
            command_acquire_timeout_ms: 5000,
            stop_timeout_ms: 5000,
            event_capacity: 16,
            log_level: "info".to_string(),
        }
    }
}

impl SupervisorSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| DeviceError::Config(format!("invalid settings in {}: {}", path.display(), e)))?;
        settings.validate()?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("baud_rate", self.baud_rate as u64),
            ("serial_timeout_ms", self.serial_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("command_acquire_timeout_ms", self.command_acquire_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("event_capacity", self.event_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DeviceError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(DeviceError::Config(format!("unknown log level '{}'", self.log_level)));
        }
        Ok(())
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn laser_settle(&self) -> Duration {
        Duration::from_millis(self.laser_settle_ms)
    }

    pub fn command_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.command_acquire_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.poll_interval(), Duration::from_secs(2));
        assert_eq!(settings.laser_settle(), Duration::from_millis(20));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "poll_interval_ms": 500, "log_level": "debug" }}"#).unwrap();

        let settings = SupervisorSettings::load(file.path()).unwrap();
        assert_eq!(settings.poll_interval_ms, 500);
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.event_capacity, 16);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "poll_interval_ms": 0 }}"#).unwrap();

        let err = SupervisorSettings::load(file.path()).unwrap_err();
        assert!(matches!(err, DeviceError::Config(msg) if msg.contains("poll_interval_ms")));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let settings = SupervisorSettings {
            log_level: "chatty".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = SupervisorSettings::load(Path::new("/nonexistent/spdc.json")).unwrap_err();
        assert!(matches!(err, DeviceError::Config(_)));
    }
}
