//! Configuration System using Figment
//!
//! Strongly-typed settings for the capture layer. Configuration is layered:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables (prefixed with `ASTROCAP_`, `__` separates sections)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ASTROCAP_LOG_LEVEL=debug
//! ASTROCAP_SERIAL__PORT=/dev/ttyUSB1
//! ASTROCAP_CAPTURE__POLL_INTERVAL="500ms"
//! ```
//!
//! Durations are written in humantime notation (`"250ms"`, `"1s"`, `"2m"`).
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//!
//! [capture]
//! poll_interval = "1s"
//! vendor_discovery_attempts = 5
//! serial_discovery_attempts = 10
//!
//! [serial]
//! port = "COM3"
//! baud_rate = 9600
//!
//! [bus]
//! camera = "CCD Imager Simulator"
//! mount = "Mount Simulator"
//! focuser = "CCD Imager Simulator (focuser)"
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, CaptureError};
use crate::error_recovery::RetryPolicy;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Capture state machine timings and budgets
    pub capture: CaptureSettings,
    /// External shutter-release serial link
    pub serial: SerialSettings,
    /// Astronomy device bus
    pub bus: BusSettings,
}

/// Timings and retry budgets of the capture state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Delay before each poll for a produced item
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Item polls when the camera times the exposure itself
    pub vendor_discovery_attempts: u32,
    /// Item polls when the shutter is released over the serial link
    pub serial_discovery_attempts: u32,
    /// Deadline for each vendor completion
    #[serde(with = "humantime_serde")]
    pub completion_timeout: Duration,
    /// How often the vendor message pump is driven while waiting
    #[serde(with = "humantime_serde")]
    pub pump_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            vendor_discovery_attempts: 5,
            serial_discovery_attempts: 10,
            completion_timeout: Duration::from_secs(30),
            pump_interval: Duration::from_millis(50),
        }
    }
}

/// Serial link to the shutter-release accessory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Line speed in baud
    pub baud_rate: u32,
    /// Fixed part of the read deadline
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Additional read allowance per expected byte
    #[serde(with = "humantime_serde")]
    pub read_interval_timeout: Duration,
    /// Deadline for writing one command byte
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Attempts per shutter command
    pub max_attempts: u32,
    /// Wait between attempts
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "COM3".to_string(),
            baud_rate: 9600,
            read_timeout: Duration::from_millis(500),
            read_interval_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(500),
            max_attempts: 10,
            backoff: Duration::from_millis(250),
        }
    }
}

impl SerialSettings {
    /// Retry policy for shutter commands.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_delay: self.backoff,
        }
    }

    /// Read deadline for a response of `len` bytes.
    pub fn read_deadline(&self, len: usize) -> Duration {
        self.read_timeout + self.read_interval_timeout * len as u32
    }
}

/// Device names and driver loading for the astronomy device bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Camera device name
    pub camera: String,
    /// Mount device name
    pub mount: String,
    /// Focuser device name
    pub focuser: String,
    /// Drivers loaded on initialization
    pub drivers: Vec<String>,
    /// Deadline for all devices to connect or disconnect
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Interval between connection-state checks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            camera: "CCD Imager Simulator".to_string(),
            mount: "Mount Simulator".to_string(),
            focuser: "CCD Imager Simulator (focuser)".to_string(),
            drivers: vec![
                "indigo_ccd_simulator".to_string(),
                "indigo_mount_simulator".to_string(),
            ],
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            capture: CaptureSettings::default(),
            serial: SerialSettings::default(),
            bus: BusSettings::default(),
        }
    }
}

impl Settings {
    /// Base figment: defaults, then `path` (if any), then the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("ASTROCAP_").split("__"))
    }

    /// Load and validate settings.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the capture layer cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let capture = &self.capture;
        if capture.vendor_discovery_attempts == 0 || capture.serial_discovery_attempts == 0 {
            return Err(CaptureError::Configuration(
                "discovery attempts must be at least 1".to_string(),
            ));
        }
        if capture.poll_interval.is_zero() || capture.pump_interval.is_zero() {
            return Err(CaptureError::Configuration(
                "capture poll and pump intervals must be non-zero".to_string(),
            ));
        }
        if capture.completion_timeout.is_zero() {
            return Err(CaptureError::Configuration(
                "completion_timeout must be non-zero".to_string(),
            ));
        }
        if self.serial.max_attempts == 0 {
            return Err(CaptureError::Configuration(
                "serial.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(CaptureError::Configuration(
                "serial.baud_rate must be non-zero".to_string(),
            ));
        }
        let bus = &self.bus;
        if [&bus.camera, &bus.mount, &bus.focuser]
            .iter()
            .any(|name| name.trim().is_empty())
        {
            return Err(CaptureError::Configuration(
                "bus device names must not be empty".to_string(),
            ));
        }
        if bus.poll_interval.is_zero() {
            return Err(CaptureError::Configuration(
                "bus.poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.capture.vendor_discovery_attempts, 5);
        assert_eq!(settings.capture.serial_discovery_attempts, 10);
        assert_eq!(settings.serial.max_attempts, 10);
        assert_eq!(settings.serial.backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "capture.toml",
                r#"
                log_level = "debug"

                [capture]
                poll_interval = "500ms"

                [serial]
                port = "/dev/ttyUSB0"
                "#,
            )?;
            jail.set_env("ASTROCAP_SERIAL__BAUD_RATE", "19200");

            let settings = Settings::load(Some(Path::new("capture.toml")))
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(settings.log_level, "debug");
            assert_eq!(settings.capture.poll_interval, Duration::from_millis(500));
            assert_eq!(settings.capture.vendor_discovery_attempts, 5);
            assert_eq!(settings.serial.port, "/dev/ttyUSB0");
            assert_eq!(settings.serial.baud_rate, 19200);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_budgets() {
        let mut settings = Settings::default();
        settings.capture.vendor_discovery_attempts = 0;
        assert!(matches!(
            settings.validate(),
            Err(CaptureError::Configuration(_))
        ));

        let mut settings = Settings::default();
        settings.bus.mount = "  ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_read_deadline_scales_with_length() {
        let serial = SerialSettings::default();
        assert_eq!(serial.read_deadline(4), Duration::from_millis(700));
    }
}
