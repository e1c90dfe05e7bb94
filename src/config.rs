//! Configuration System using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `PIEZO_` (nested keys separated by `__`)
//! 2. A TOML configuration file (default: `config/piezo_scan.toml`)
//! 3. Built-in defaults (every section and key is optional)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! PIEZO_APPLICATION__LOG_LEVEL=debug
//! PIEZO_SERIAL__PORT=/dev/ttyUSB1
//! PIEZO_SETTLE__ENABLED=true
//! ```
//!
//! # Example
//!
//! ```no_run
//! use piezo_scan::config::ScanConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ScanConfig::load()?;
//!     println!("Serial port: {}", config.serial.port);
//!     println!("Settling enabled: {}", config.settle.enabled);
//!     Ok(())
//! }
//! ```

use crate::axis::Axis;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/piezo_scan.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PIEZO_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but cannot drive the stage
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link to the controller
    pub serial: SerialConfig,
    /// Trigger pulse widths and dwell floor
    pub timing: TimingConfig,
    /// Threshold-gated settling
    pub settle: SettleConfig,
    /// Which channels carry the fast and slow scan axes
    pub axes: AxesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "piezo_scan".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, with ANSI colours
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
    /// XON/XOFF flow control
    pub software_flow_control: bool,
    /// Record terminator appended to commands
    pub line_terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout_ms: 1000,
            software_flow_control: true,
            line_terminator: "\n".to_string(),
        }
    }
}

/// Trigger timing in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Line pulse width
    pub line_pulse_ms: u64,
    /// Frame-start pulse width
    pub frame_pulse_ms: u64,
    /// Frame-end pulse width (boustrophedon only)
    pub frame_end_pulse_ms: u64,
    /// Synchronous pixel pulse width used by verified line scans
    pub verified_pixel_pulse_ms: u64,
    /// Background pixel pulse high time
    pub pixel_on_ms: u64,
    /// Background pixel pulse low time after the falling edge
    pub pixel_off_ms: u64,
    /// Smallest dwell time a frame scan accepts
    pub min_dwell_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            line_pulse_ms: 100,
            frame_pulse_ms: 10,
            frame_end_pulse_ms: 100,
            verified_pixel_pulse_ms: 10,
            pixel_on_ms: 50,
            pixel_off_ms: 50,
            min_dwell_ms: 100,
        }
    }
}

impl TimingConfig {
    /// Width of the line-start pulse
    pub fn line_pulse(&self) -> Duration {
        Duration::from_millis(self.line_pulse_ms)
    }

    /// Width of the frame-start pulse
    pub fn frame_pulse(&self) -> Duration {
        Duration::from_millis(self.frame_pulse_ms)
    }

    /// Width of the boustrophedon frame-end pulse
    pub fn frame_end_pulse(&self) -> Duration {
        Duration::from_millis(self.frame_end_pulse_ms)
    }

    /// Width of the synchronous pixel pulse in verified mode
    pub fn verified_pixel_pulse(&self) -> Duration {
        Duration::from_millis(self.verified_pixel_pulse_ms)
    }

    /// High time of the background pixel pulse
    pub fn pixel_on(&self) -> Duration {
        Duration::from_millis(self.pixel_on_ms)
    }

    /// Low time that follows it
    pub fn pixel_off(&self) -> Duration {
        Duration::from_millis(self.pixel_off_ms)
    }

    /// Shortest dwell a frame scan accepts
    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }
}

/// Threshold-gated settling before a line or frame scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// Wait for the stage to reach the first sample before scanning
    pub enabled: bool,
    /// Accepted |measured - target| in volts
    pub tolerance: f64,
    /// Pause between read-backs; 0 polls back-to-back
    pub poll_interval_ms: u64,
    /// Give up after this long; absent means wait indefinitely
    pub timeout_ms: Option<u64>,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tolerance: 2.0,
            poll_interval_ms: 0,
            timeout_ms: None,
        }
    }
}

impl SettleConfig {
    /// Pause between settling read-backs
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settling deadline, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Channel assignment for frame scans
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxesConfig {
    /// In-plane axis scanned within each line
    pub fast: Axis,
    /// Axis stepped once per line
    pub slow: Axis,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            fast: Axis::X,
            slow: Axis::Y,
        }
    }
}

impl ScanConfig {
    /// Load configuration from the default file location plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file plus environment overrides
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ScanConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot drive the stage
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Validation("serial.baud_rate must be non-zero".into()));
        }
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Validation("serial.port must not be empty".into()));
        }

        let t = &self.timing;
        for (name, value) in [
            ("line_pulse_ms", t.line_pulse_ms),
            ("frame_pulse_ms", t.frame_pulse_ms),
            ("frame_end_pulse_ms", t.frame_end_pulse_ms),
            ("verified_pixel_pulse_ms", t.verified_pixel_pulse_ms),
            ("pixel_on_ms", t.pixel_on_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "timing.{} must be non-zero",
                    name
                )));
            }
        }
        // A background pixel pulse has to finish within one dwell.
        let period = t.pixel_on_ms.checked_add(t.pixel_off_ms).ok_or_else(|| {
            ConfigError::Validation(format!(
                "pixel pulse period {} + {} ms overflows",
                t.pixel_on_ms, t.pixel_off_ms
            ))
        })?;
        if period > t.min_dwell_ms {
            return Err(ConfigError::Validation(format!(
                "pixel pulse period {} ms exceeds timing.min_dwell_ms {} ms",
                period, t.min_dwell_ms
            )));
        }

        if !(self.settle.tolerance.is_finite() && self.settle.tolerance >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "settle.tolerance must be a non-negative number, got {}",
                self.settle.tolerance
            )));
        }

        if self.axes.fast == self.axes.slow {
            return Err(ConfigError::Validation(format!(
                "axes.fast and axes.slow must differ (both {})",
                self.axes.fast
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScanConfig::default();
        config.validate().unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.timing.min_dwell(), Duration::from_millis(100));
        assert_eq!(config.axes.fast, Axis::X);
        assert_eq!(config.axes.slow, Axis::Y);
        assert!(!config.settle.enabled);
        assert_eq!(config.settle.timeout(), None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ScanConfig::from_toml_str(
            r#"
            [serial]
            port = "/dev/ttyUSB3"

            [settle]
            enabled = true
            tolerance = 0.5
            timeout_ms = 2000

            [axes]
            fast = 2
            slow = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.settle.enabled);
        assert_eq!(config.settle.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.axes.fast, Axis::Z);
        assert_eq!(config.timing.line_pulse_ms, 100);
    }

    #[test]
    fn test_invalid_axis_id_rejected() {
        let result = ScanConfig::from_toml_str("[axes]\nfast = 4\n");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_same_fast_and_slow_axis_rejected() {
        let result = ScanConfig::from_toml_str("[axes]\nfast = 1\nslow = 1\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_pixel_period_longer_than_dwell_rejected() {
        let result = ScanConfig::from_toml_str("[timing]\npixel_on_ms = 80\npixel_off_ms = 80\n");
        match result {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("pixel pulse period")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_pixel_period_overflow_rejected() {
        let mut config = ScanConfig::default();
        config.timing.pixel_on_ms = u64::MAX;
        config.timing.pixel_off_ms = 1;
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("overflows")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let result = ScanConfig::from_toml_str("[settle]\ntolerance = -1.0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
log_format = "json"

[timing]
line_pulse_ms = 50
"#
        )
        .unwrap();

        let config = ScanConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.timing.line_pulse(), Duration::from_millis(50));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ScanConfig::load_from("/nonexistent/piezo_scan.toml").unwrap();
        assert_eq!(config.serial.port, SerialConfig::default().port);
    }
}
