//! Station configuration.
//!
//! Every field has a default so a minimal TOML file only needs to name the
//! device family and how to reach it:
//!
//! ```toml
//! family = "hid_console"
//! logging_interval_minutes = 5
//! rollover_hour = 9
//! dst_adjust = true
//!
//! [transport]
//! kind = "hid"
//! vendor_id = 0x1941
//! product_id = 0x8021
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accumulators::AccumulationSettings;
use crate::errors::{DriverError, Result};
use crate::retry::RetryPolicy;
use crate::validation::SanityBounds;

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// Network gateway with sum-checksummed request/response packets and TLV live data.
    Gateway,
    /// Serial console addressed nibble by nibble with per-step acknowledgements.
    NibbleSerial,
    /// USB HID console with a circular history memory.
    #[default]
    HidConsole,
    /// Serial console that streams checksummed packets unprompted.
    StreamSerial,
}

impl DeviceFamily {
    pub fn name(self) -> &'static str {
        match self {
            DeviceFamily::Gateway => "gateway",
            DeviceFamily::NibbleSerial => "nibble_serial",
            DeviceFamily::HidConsole => "hid_console",
            DeviceFamily::StreamSerial => "stream_serial",
        }
    }

    /// Live poll period when the configuration does not override it.
    pub fn default_poll_period(self) -> Duration {
        match self {
            DeviceFamily::NibbleSerial => Duration::from_secs(30),
            _ => Duration::from_secs(10),
        }
    }

    /// Exchange attempts before giving up: byte-level protocols need many,
    /// packet-level ones few.
    pub fn default_attempts(self) -> u32 {
        match self {
            DeviceFamily::NibbleSerial => 50,
            DeviceFamily::HidConsole => 5,
            DeviceFamily::Gateway | DeviceFamily::StreamSerial => 3,
        }
    }

    pub fn default_transport(self) -> TransportConfig {
        match self {
            DeviceFamily::Gateway => TransportConfig::Tcp {
                host: "192.168.1.10".into(),
                port: 45000,
            },
            DeviceFamily::NibbleSerial => TransportConfig::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 2400,
                dtr: Some(false),
                rts: Some(true),
            },
            DeviceFamily::HidConsole => TransportConfig::Hid {
                vendor_id: 0x1941,
                product_id: 0x8021,
                path: None,
            },
            DeviceFamily::StreamSerial => TransportConfig::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 9600,
                dtr: Some(true),
                rts: Some(false),
            },
        }
    }
}

impl std::str::FromStr for DeviceFamily {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gateway" => Ok(DeviceFamily::Gateway),
            "nibble_serial" | "nibble" => Ok(DeviceFamily::NibbleSerial),
            "hid_console" | "hid" => Ok(DeviceFamily::HidConsole),
            "stream_serial" | "stream" => Ok(DeviceFamily::StreamSerial),
            other => Err(DriverError::Config(format!("unknown device family: {other}"))),
        }
    }
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        port: String,
        baud_rate: u32,
        #[serde(default)]
        dtr: Option<bool>,
        #[serde(default)]
        rts: Option<bool>,
    },
    Hid {
        vendor_id: u16,
        product_id: u16,
        #[serde(default)]
        path: Option<String>,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

/// Retry and reconnect budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Exchange attempts; `None` uses the family default.
    pub attempts: Option<u32>,
    pub backoff_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_secs: u64,
    /// Attempts to re-read a log entry after the write pointer moved.
    pub drift_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: None,
            backoff_ms: 50,
            reconnect_attempts: 3,
            reconnect_backoff_secs: 10,
            drift_retries: 3,
        }
    }
}

/// Clock synchronisation and read-avoidance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    /// Window start relative to a device tick, in seconds (negative = before the tick).
    pub avoid_start_secs: i64,
    /// Window end relative to a device tick, in seconds.
    pub avoid_end_secs: i64,
    pub sample_interval_ms: u64,
    pub max_duration_secs: u64,
    /// Consecutive probe failures that end synchronisation early.
    pub max_failures: u32,
    /// Skip synchronisation and always assume host-minute alignment.
    pub disabled: bool,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            avoid_start_secs: -2,
            avoid_end_secs: 3,
            sample_interval_ms: 500,
            max_duration_secs: 60,
            max_failures: 3,
            disabled: false,
        }
    }
}

/// Complete configuration of one station session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub family: DeviceFamily,
    /// `None` uses [`DeviceFamily::default_transport`].
    pub transport: Option<TransportConfig>,
    pub logging_interval_minutes: u16,
    /// Local hour at which the weather day closes (0 = midnight).
    pub rollover_hour: u32,
    /// Shift a non-midnight rollover one hour later while daylight saving time is active.
    pub dst_adjust: bool,
    /// Trust host time rather than device timestamps when reconstructing history.
    pub ignore_device_clock: bool,
    /// HID console carries a solar/UV sensor (wider history entries).
    pub solar_sensor: bool,
    pub io_timeout_ms: u64,
    pub poll_period_secs: Option<u64>,
    /// Consecutive failed reads before the session reports "data stopped".
    pub failure_threshold: u32,
    pub retry: RetrySettings,
    pub clock: ClockSettings,
    pub bounds: SanityBounds,
    pub accumulation: AccumulationSettings,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            family: DeviceFamily::default(),
            transport: None,
            logging_interval_minutes: 5,
            rollover_hour: 0,
            dst_adjust: false,
            ignore_device_clock: false,
            solar_sensor: false,
            io_timeout_ms: 1000,
            poll_period_secs: None,
            failure_threshold: 5,
            retry: RetrySettings::default(),
            clock: ClockSettings::default(),
            bounds: SanityBounds::default(),
            accumulation: AccumulationSettings::default(),
        }
    }
}

impl StationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StationConfig =
            toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values no device could honour.
    pub fn validate(&self) -> Result<()> {
        if self.rollover_hour > 23 {
            return Err(DriverError::Config(format!(
                "rollover_hour must be 0-23, got {}",
                self.rollover_hour
            )));
        }
        if self.logging_interval_minutes == 0 || self.logging_interval_minutes > 240 {
            return Err(DriverError::Config(format!(
                "logging_interval_minutes must be 1-240, got {}",
                self.logging_interval_minutes
            )));
        }
        if self.io_timeout_ms == 0 {
            return Err(DriverError::Config("io_timeout_ms must be positive".into()));
        }
        if self.failure_threshold == 0 {
            return Err(DriverError::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.poll_period_secs == Some(0) {
            return Err(DriverError::Config("poll_period_secs must be positive".into()));
        }
        if self.clock.avoid_start_secs > self.clock.avoid_end_secs {
            return Err(DriverError::Config(
                "clock.avoid_start_secs must not exceed clock.avoid_end_secs".into(),
            ));
        }
        if self.clock.avoid_end_secs - self.clock.avoid_start_secs >= 30 {
            return Err(DriverError::Config(
                "clock avoidance window must be narrower than 30 seconds".into(),
            ));
        }
        if self.clock.sample_interval_ms == 0 {
            return Err(DriverError::Config(
                "clock.sample_interval_ms must be positive".into(),
            ));
        }
        self.bounds.validate()?;
        self.accumulation.validate()?;
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        self.transport
            .clone()
            .unwrap_or_else(|| self.family.default_transport())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn poll_period(&self) -> Duration {
        self.poll_period_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.family.default_poll_period())
    }

    /// Retry policy for one device exchange.
    pub fn exchange_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry
                .attempts
                .unwrap_or_else(|| self.family.default_attempts()),
            Duration::from_millis(self.retry.backoff_ms),
        )
    }

    /// Retry policy for reopening a lost transport.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.reconnect_attempts,
            Duration::from_secs(self.retry.reconnect_backoff_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = StationConfig::from_toml_str("family = \"gateway\"\n").unwrap();
        assert_eq!(DeviceFamily::Gateway, config.family);
        assert_eq!(5, config.logging_interval_minutes);
        assert_eq!(Duration::from_secs(10), config.poll_period());
        assert_eq!(3, config.exchange_policy().attempts);
        assert!(matches!(config.transport(), TransportConfig::Tcp { .. }));
    }

    #[test]
    fn test_full_document() {
        let text = r#"
            family = "nibble_serial"
            logging_interval_minutes = 10
            rollover_hour = 9
            dst_adjust = true
            ignore_device_clock = true
            poll_period_secs = 20

            [transport]
            kind = "serial"
            port = "/dev/ttyS1"
            baud_rate = 2400
            rts = true

            [retry]
            reconnect_backoff_secs = 5

            [clock]
            avoid_start_secs = -1
            avoid_end_secs = 4

            [bounds]
            outdoor_temperature = { min = -40.0, max = 60.0 }
        "#;
        let config = StationConfig::from_toml_str(text).unwrap();
        assert_eq!(9, config.rollover_hour);
        assert!(config.dst_adjust);
        assert!(config.ignore_device_clock);
        assert_eq!(Duration::from_secs(20), config.poll_period());
        assert_eq!(50, config.exchange_policy().attempts);
        assert_eq!(Duration::from_secs(5), config.reconnect_policy().backoff);
        assert_eq!(-1, config.clock.avoid_start_secs);
        assert_eq!(60.0, config.bounds.outdoor_temperature.max);
        assert_eq!(
            TransportConfig::Serial {
                port: "/dev/ttyS1".into(),
                baud_rate: 2400,
                dtr: None,
                rts: Some(true),
            },
            config.transport()
        );
    }

    #[test]
    fn test_rejects_bad_rollover_hour() {
        let result = StationConfig::from_toml_str("rollover_hour = 24\n");
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_avoidance_window() {
        let result =
            StationConfig::from_toml_str("[clock]\navoid_start_secs = 5\navoid_end_secs = 1\n");
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!(DeviceFamily::HidConsole, "hid".parse().unwrap());
        assert_eq!(DeviceFamily::StreamSerial, "stream_serial".parse().unwrap());
        assert!("weather".parse::<DeviceFamily>().is_err());
    }
}
