//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field carries a default, so an empty file (or no file at all) yields
//! a working configuration that targets the device's access-point address.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TunerError};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub leveling: LevelingConfig,
}

/// Device addressing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Base URL of a bridging proxy. When set, requests are routed through it.
    #[serde(default)]
    pub bridge_url: Option<String>,
}

/// Telemetry stream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default)]
    pub record: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Sensor snapshot configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Auto-level tuning
#[derive(Debug, Deserialize, Clone)]
pub struct LevelingConfig {
    #[serde(default = "default_test_movement_deg")]
    pub test_movement_deg: i32,

    #[serde(default = "default_polarity_threshold")]
    pub polarity_threshold: f64,

    #[serde(default = "default_detect_settle_ms")]
    pub detect_settle_ms: u64,

    #[serde(default = "default_restore_settle_ms")]
    pub restore_settle_ms: u64,

    #[serde(default = "default_adjust_settle_ms")]
    pub adjust_settle_ms: u64,

    /// Wait after writing changed `reversed` flags; the corner physically moves
    #[serde(default = "default_polarity_settle_ms")]
    pub polarity_settle_ms: u64,

    #[serde(default = "default_level_tolerance_deg")]
    pub level_tolerance_deg: f64,

    #[serde(default = "default_adjustment_step_deg")]
    pub adjustment_step_deg: f64,

    #[serde(default = "default_max_adjustment_deg")]
    pub max_adjustment_deg: i32,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_success_hold_ms")]
    pub success_hold_ms: u64,

    #[serde(default = "default_failure_hold_ms")]
    pub failure_hold_ms: u64,
}

// Default value functions
fn default_address() -> String { "192.168.4.1".to_string() }
fn default_http_timeout_ms() -> u64 { 5000 }

fn default_reconnect_delay_ms() -> u64 { 2000 }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_min_interval_ms() -> u64 { 300 }
fn default_request_timeout_ms() -> u64 { 1500 }

fn default_test_movement_deg() -> i32 { 10 }
fn default_polarity_threshold() -> f64 { 1.0 }
fn default_detect_settle_ms() -> u64 { 800 }
fn default_restore_settle_ms() -> u64 { 300 }
fn default_adjust_settle_ms() -> u64 { 500 }
fn default_polarity_settle_ms() -> u64 { 500 }
fn default_level_tolerance_deg() -> f64 { 1.5 }
fn default_adjustment_step_deg() -> f64 { 2.0 }
fn default_max_adjustment_deg() -> i32 { 20 }
fn default_max_iterations() -> u32 { 15 }
fn default_success_hold_ms() -> u64 { 2000 }
fn default_failure_hold_ms() -> u64 { 3000 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            http_timeout_ms: default_http_timeout_ms(),
            bridge_url: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            record: false,
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            test_movement_deg: default_test_movement_deg(),
            polarity_threshold: default_polarity_threshold(),
            detect_settle_ms: default_detect_settle_ms(),
            restore_settle_ms: default_restore_settle_ms(),
            adjust_settle_ms: default_adjust_settle_ms(),
            polarity_settle_ms: default_polarity_settle_ms(),
            level_tolerance_deg: default_level_tolerance_deg(),
            adjustment_step_deg: default_adjustment_step_deg(),
            max_adjustment_deg: default_max_adjustment_deg(),
            max_iterations: default_max_iterations(),
            success_hold_ms: default_success_hold_ms(),
            failure_hold_ms: default_failure_hold_ms(),
        }
    }
}

impl DeviceConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SensorConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn invalid(message: impl std::fmt::Display) -> TunerError {
    TunerError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use suspension_tuner::config::Config;
    ///
    /// let config = Config::load("config/tuner.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.device.address.trim().is_empty() {
            return Err(invalid("device address cannot be empty"));
        }

        if self.device.http_timeout_ms == 0 || self.device.http_timeout_ms > 60000 {
            return Err(invalid("http_timeout_ms must be between 1 and 60000"));
        }

        if let Some(bridge) = &self.device.bridge_url {
            if !(bridge.starts_with("http://") || bridge.starts_with("https://")) {
                return Err(invalid("bridge_url must start with http:// or https://"));
            }
        }

        if self.telemetry.reconnect_delay_ms == 0 || self.telemetry.reconnect_delay_ms > 60000 {
            return Err(invalid("reconnect_delay_ms must be between 1 and 60000"));
        }

        if self.telemetry.record && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when recording"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.sensors.request_timeout_ms == 0 || self.sensors.request_timeout_ms > 10000 {
            return Err(invalid("request_timeout_ms must be between 1 and 10000"));
        }

        let lv = &self.leveling;

        if lv.max_iterations == 0 {
            return Err(invalid("max_iterations must be greater than 0"));
        }

        if lv.max_adjustment_deg <= 0 {
            return Err(invalid("max_adjustment_deg must be greater than 0"));
        }

        if lv.test_movement_deg <= 0 || lv.test_movement_deg > lv.max_adjustment_deg {
            return Err(invalid("test_movement_deg must be between 1 and max_adjustment_deg"));
        }

        for (name, value) in [
            ("polarity_threshold", lv.polarity_threshold),
            ("level_tolerance_deg", lv.level_tolerance_deg),
            ("adjustment_step_deg", lv.adjustment_step_deg),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(invalid(format!("{} must be a positive number", name)));
            }
        }

        // A post-settle read must always reach the device, never the cache
        for (name, settle) in [
            ("detect_settle_ms", lv.detect_settle_ms),
            ("restore_settle_ms", lv.restore_settle_ms),
            ("adjust_settle_ms", lv.adjust_settle_ms),
            ("polarity_settle_ms", lv.polarity_settle_ms),
        ] {
            if settle < self.sensors.min_interval_ms {
                return Err(invalid(format!(
                    "{} must be at least sensors.min_interval_ms ({})",
                    name, self.sensors.min_interval_ms
                )));
            }
        }

        Ok(())
    }
}
