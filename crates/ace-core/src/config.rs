//! Device configuration
//!
//! Loaded from JSON; every field is optional and falls back to the defaults
//! below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Lowest dryer temperature the device accepts, in °C
pub const MIN_DRYER_TEMPERATURE: u32 = 20;

/// Longest accepted timing setting (one day), in milliseconds
pub const MAX_DURATION_MS: u64 = 86_400_000;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config is not valid JSON for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field fails validation
    #[error("Invalid value for '{field}': {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Settings for one ACE device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AceConfig {
    /// Serial port; auto-detected when absent
    pub serial: Option<String>,
    /// Serial baud rate
    pub baud: u32,

    /// How long a sent request waits for its response
    pub response_timeout_ms: u64,
    /// Serial write timeout
    pub write_timeout_ms: u64,
    /// Outbound queue capacity
    pub max_queue_size: usize,

    /// Default feed speed, mm/s
    pub feed_speed: u32,
    /// Default retract speed, mm/s
    pub retract_speed: u32,
    /// Default retract mode, 0 normal or 1 enhanced
    pub retract_mode: u8,
    /// Unwind length before a tool change, mm
    pub toolchange_retract_length: u32,
    /// Consecutive stable status samples that complete a park
    pub park_hit_count: u32,
    /// Upper bound for `start_drying`, °C
    pub max_dryer_temperature: u32,
    /// Forget the feed-assist slot once a park completes
    pub disable_assist_after_toolchange: bool,
    /// Allow `infinity_spool` to advance to the next slot
    pub infinity_spool_mode: bool,
    /// Slots per device
    pub slot_count: u8,

    /// Opens tried per connect
    pub max_connection_attempts: u32,
    /// Back-off before reconnecting after a transport error
    pub reconnect_delay_ms: u64,
    /// Supervise tick while disconnected
    pub connect_check_interval_ms: u64,
    /// Transport read tick
    pub read_interval_ms: u64,
    /// Write tick; one queued request is sent per tick
    pub write_interval_ms: u64,
    /// Status polling interval while idle
    pub status_interval_ms: u64,
    /// Status interval while a park session is active
    pub park_status_interval_ms: u64,
    /// Wall-clock bound on one park session
    pub park_timeout_ms: u64,
    /// Upper bound on waiting for the vacated slot during a tool change
    pub slot_ready_timeout_ms: u64,
    /// Poll interval while waiting for the vacated slot
    pub slot_ready_poll_ms: u64,
}

impl Default for AceConfig {
    fn default() -> Self {
        Self {
            serial: None,
            baud: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: 500,
            max_queue_size: 20,
            feed_speed: 50,
            retract_speed: 50,
            retract_mode: 0,
            toolchange_retract_length: 100,
            park_hit_count: 5,
            max_dryer_temperature: 55,
            disable_assist_after_toolchange: true,
            infinity_spool_mode: false,
            slot_count: 4,
            max_connection_attempts: 5,
            reconnect_delay_ms: 1000,
            connect_check_interval_ms: 1000,
            read_interval_ms: 10,
            write_interval_ms: 50,
            status_interval_ms: 1000,
            park_status_interval_ms: 200,
            park_timeout_ms: 60_000,
            slot_ready_timeout_ms: 30_000,
            slot_ready_poll_ms: 500,
        }
    }
}

fn bounded_ms(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value > MAX_DURATION_MS {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{value} exceeds {MAX_DURATION_MS} ms"),
        });
    }
    Ok(())
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

impl AceConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Reject zero capacities, speeds and intervals, out-of-range modes and
    /// timings above [`MAX_DURATION_MS`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("baud", self.baud.into())?;
        non_zero("response_timeout_ms", self.response_timeout_ms)?;
        non_zero("write_timeout_ms", self.write_timeout_ms)?;
        non_zero("max_queue_size", self.max_queue_size as u64)?;
        non_zero("feed_speed", self.feed_speed.into())?;
        non_zero("retract_speed", self.retract_speed.into())?;
        non_zero("park_hit_count", self.park_hit_count.into())?;
        non_zero("slot_count", self.slot_count.into())?;
        non_zero("max_connection_attempts", self.max_connection_attempts.into())?;
        non_zero("read_interval_ms", self.read_interval_ms)?;
        non_zero("write_interval_ms", self.write_interval_ms)?;
        non_zero("connect_check_interval_ms", self.connect_check_interval_ms)?;
        non_zero("status_interval_ms", self.status_interval_ms)?;
        non_zero("park_status_interval_ms", self.park_status_interval_ms)?;
        non_zero("park_timeout_ms", self.park_timeout_ms)?;
        non_zero("slot_ready_poll_ms", self.slot_ready_poll_ms)?;

        for (field, value) in [
            ("response_timeout_ms", self.response_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("connect_check_interval_ms", self.connect_check_interval_ms),
            ("read_interval_ms", self.read_interval_ms),
            ("write_interval_ms", self.write_interval_ms),
            ("status_interval_ms", self.status_interval_ms),
            ("park_status_interval_ms", self.park_status_interval_ms),
            ("park_timeout_ms", self.park_timeout_ms),
            ("slot_ready_timeout_ms", self.slot_ready_timeout_ms),
            ("slot_ready_poll_ms", self.slot_ready_poll_ms),
        ] {
            bounded_ms(field, value)?;
        }

        if self.retract_mode > 1 {
            return Err(ConfigError::Invalid {
                field: "retract_mode",
                reason: format!("{} is not 0 or 1", self.retract_mode),
            });
        }
        if self.max_dryer_temperature < MIN_DRYER_TEMPERATURE {
            return Err(ConfigError::Invalid {
                field: "max_dryer_temperature",
                reason: format!("must be at least {MIN_DRYER_TEMPERATURE}"),
            });
        }
        Ok(())
    }

    /// [`Self::response_timeout_ms`] as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Serial write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Back-off before a reconnect
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Supervise tick interval
    pub fn connect_check_interval(&self) -> Duration {
        Duration::from_millis(self.connect_check_interval_ms)
    }

    /// Read tick interval
    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    /// Write tick interval
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    /// Status polling interval, shortened while parking
    pub fn status_interval(&self, parking: bool) -> Duration {
        if parking {
            Duration::from_millis(self.park_status_interval_ms)
        } else {
            Duration::from_millis(self.status_interval_ms)
        }
    }

    /// Park session deadline
    pub fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms)
    }

    /// Bound on the vacated-slot wait
    pub fn slot_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_ready_timeout_ms)
    }

    /// Vacated-slot poll interval
    pub fn slot_ready_poll(&self) -> Duration {
        Duration::from_millis(self.slot_ready_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AceConfig::from_json_str(r#"{"serial": "/dev/ttyACM0", "park_hit_count": 3}"#)
            .unwrap();
        assert_eq!(config.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.park_hit_count, 3);
        assert_eq!(config.baud, 115200);
        assert_eq!(config.max_queue_size, 20);
        assert!(config.disable_assist_after_toolchange);
    }

    #[test]
    fn test_validation() {
        let err = AceConfig::from_json_str(r#"{"retract_mode": 2}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retract_mode", .. }));

        let err = AceConfig::from_json_str(r#"{"max_queue_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_queue_size", .. }));

        let err = AceConfig::from_json_str(r#"{"max_dryer_temperature": 10}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_dryer_temperature", .. }));

        let err =
            AceConfig::from_json_str(r#"{"park_timeout_ms": 18446744073709551615}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "park_timeout_ms", .. }));
        assert!(AceConfig::from_json_str(r#"{"reconnect_delay_ms": 86400000}"#).is_ok());

        assert!(matches!(
            AceConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"infinity_spool_mode": true, "slot_count": 4}}"#).unwrap();
        let config = AceConfig::from_file(file.path()).unwrap();
        assert!(config.infinity_spool_mode);

        assert!(matches!(
            AceConfig::from_file(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_status_interval_adapts() {
        let config = AceConfig::default();
        assert_eq!(config.status_interval(false), Duration::from_secs(1));
        assert_eq!(config.status_interval(true), Duration::from_millis(200));
    }
}
