/*!
 * Configuration management for the OpenTherm driver.
 *
 * This module loads and validates the start-up parameters of the driver. Once built, a configuration is immutable.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Highest GPIO number accepted for the OpenTherm lines
pub const MAX_GPIO_PIN: u8 = 63;

/// Longest accepted receive timeout in milliseconds
pub const MAX_RX_TIMEOUT_MS: u64 = 1000;

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Wire configuration
    #[serde(default)]
    pub wire: WireConfig,

    /// Polling configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Equitherm curve tuning
    #[serde(default)]
    pub equitherm: EquithermConfig,

    /// Temperature and modulation limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Space heating defaults
    #[serde(default)]
    pub heating: HeatingConfig,

    /// Domestic hot water defaults
    #[serde(default)]
    pub dhw: DhwConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pin assignment and receive behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireConfig {
    /// GPIO sampled for the boiler's responses
    #[serde(default = "default_in_pin")]
    pub in_pin: u8,

    /// GPIO driven for the master's requests
    #[serde(default = "default_out_pin")]
    pub out_pin: u8,

    /// Time allowed for a response start bit to arrive, in milliseconds
    #[serde(default = "default_rx_timeout_ms")]
    pub rx_timeout_ms: u64,

    /// Log every raw frame
    #[serde(default)]
    pub debug: bool,
}

/// Priority class of a polled data-ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollPriority {
    /// Polled first
    High,
    /// Default class
    Normal,
    /// Polled after everything else
    Low,
}

impl Default for PollPriority {
    fn default() -> Self {
        PollPriority::Normal
    }
}

/// One row of the poll table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollEntryConfig {
    /// OpenTherm data-ID
    pub data_id: u8,

    /// Minimum time between two reads, in milliseconds
    pub interval_ms: u64,

    /// Priority class
    #[serde(default)]
    pub priority: PollPriority,
}

impl PollEntryConfig {
    /// Create a poll table row
    pub fn new(data_id: u8, interval_ms: u64, priority: PollPriority) -> Self {
        Self {
            data_id,
            interval_ms,
            priority,
        }
    }
}

/// Poll cadence and failure handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll cycle period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failed exchanges before values are reported stale
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Data-IDs read periodically
    #[serde(default = "default_poll_entries")]
    pub entries: Vec<PollEntryConfig>,
}

/// Equitherm heating curve parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquithermConfig {
    /// Curve slope
    #[serde(default = "default_eq_n")]
    pub n: f64,

    /// Curve shift
    #[serde(default = "default_eq_k")]
    pub k: f64,

    /// Constant flow offset
    #[serde(default = "default_eq_t")]
    pub t: f64,

    /// Indoor error gain
    #[serde(default = "default_eq_feedback_gain")]
    pub feedback_gain: f64,
}

/// Setpoint limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Lowest flow setpoint ever written
    #[serde(default = "default_min_setpoint")]
    pub min_setpoint: f64,

    /// Highest flow setpoint for space heating
    #[serde(default = "default_max_boiler_temp_heating")]
    pub max_boiler_temp_heating: f64,

    /// Highest domestic hot water setpoint
    #[serde(default = "default_max_dhw_temp")]
    pub max_dhw_temp: f64,

    /// Flow setpoint used while emergency mode is on
    #[serde(default = "default_emergency_setpoint")]
    pub emergency_setpoint: f64,

    /// Maximum relative modulation, percent
    #[serde(default = "default_max_modulation")]
    pub max_modulation: f64,
}

/// Who computes the flow temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationMode {
    /// The driver computes the flow setpoint from the equitherm curve
    Equitherm,
    /// The boiler's own curve is used; the driver reports room values only
    Boiler,
}

impl Default for CompensationMode {
    fn default() -> Self {
        CompensationMode::Equitherm
    }
}

/// Space heating start-up values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatingConfig {
    /// Whether central heating starts enabled
    #[serde(default = "default_heating_enabled")]
    pub enabled: bool,

    /// Indoor target temperature
    #[serde(default = "default_target_indoor")]
    pub target_indoor: f64,

    /// Compensation mode
    #[serde(default)]
    pub compensation: CompensationMode,
}

/// Domestic hot water operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhwMode {
    /// Hot water disabled
    Off,
    /// Enabled at the eco temperature
    Eco,
    /// Enabled at the normal temperature
    Heat,
}

impl Default for DhwMode {
    fn default() -> Self {
        DhwMode::Heat
    }
}

/// Domestic hot water start-up values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DhwConfig {
    /// Operating mode
    #[serde(default)]
    pub mode: DhwMode,

    /// Setpoint in eco mode
    #[serde(default = "default_dhw_eco_temp")]
    pub eco_temp: f64,

    /// Setpoint in heat mode
    #[serde(default = "default_dhw_normal_temp")]
    pub normal_temp: f64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in each line
    #[serde(default = "default_log_target")]
    pub with_target: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wire: WireConfig::default(),
            polling: PollingConfig::default(),
            equitherm: EquithermConfig::default(),
            limits: LimitsConfig::default(),
            heating: HeatingConfig::default(),
            dhw: DhwConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            in_pin: default_in_pin(),
            out_pin: default_out_pin(),
            rx_timeout_ms: default_rx_timeout_ms(),
            debug: false,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            failure_threshold: default_failure_threshold(),
            entries: default_poll_entries(),
        }
    }
}

impl Default for EquithermConfig {
    fn default() -> Self {
        Self {
            n: default_eq_n(),
            k: default_eq_k(),
            t: default_eq_t(),
            feedback_gain: default_eq_feedback_gain(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_setpoint: default_min_setpoint(),
            max_boiler_temp_heating: default_max_boiler_temp_heating(),
            max_dhw_temp: default_max_dhw_temp(),
            emergency_setpoint: default_emergency_setpoint(),
            max_modulation: default_max_modulation(),
        }
    }
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            enabled: default_heating_enabled(),
            target_indoor: default_target_indoor(),
            compensation: CompensationMode::default(),
        }
    }
}

impl Default for DhwConfig {
    fn default() -> Self {
        Self {
            mode: DhwMode::default(),
            eco_temp: default_dhw_eco_temp(),
            normal_temp: default_dhw_normal_temp(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_log_target(),
        }
    }
}

fn default_in_pin() -> u8 {
    5
}

fn default_out_pin() -> u8 {
    6
}

fn default_rx_timeout_ms() -> u64 {
    40
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

// Data-IDs: 25 boiler temp, 28 return temp, 17 modulation, 19 DHW flow,
// 26 DHW temp, 18 CH pressure, 5 fault flags, 56 DHW setpoint, 27 outside temp.
fn default_poll_entries() -> Vec<PollEntryConfig> {
    vec![
        PollEntryConfig::new(25, 10_000, PollPriority::Normal),
        PollEntryConfig::new(28, 10_000, PollPriority::Normal),
        PollEntryConfig::new(17, 10_000, PollPriority::Normal),
        PollEntryConfig::new(19, 10_000, PollPriority::Low),
        PollEntryConfig::new(26, 30_000, PollPriority::Low),
        PollEntryConfig::new(18, 30_000, PollPriority::Low),
        PollEntryConfig::new(5, 30_000, PollPriority::Low),
        PollEntryConfig::new(56, 60_000, PollPriority::Low),
        PollEntryConfig::new(27, 60_000, PollPriority::Low),
    ]
}

fn default_eq_n() -> f64 {
    0.7
}

fn default_eq_k() -> f64 {
    3.0
}

fn default_eq_t() -> f64 {
    2.0
}

fn default_eq_feedback_gain() -> f64 {
    3.0
}

fn default_min_setpoint() -> f64 {
    25.0
}

fn default_max_boiler_temp_heating() -> f64 {
    70.0
}

fn default_max_dhw_temp() -> f64 {
    50.0
}

fn default_emergency_setpoint() -> f64 {
    60.0
}

fn default_max_modulation() -> f64 {
    100.0
}

fn default_heating_enabled() -> bool {
    true
}

fn default_target_indoor() -> f64 {
    21.0
}

fn default_dhw_eco_temp() -> f64 {
    45.0
}

fn default_dhw_normal_temp() -> f64 {
    60.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_target() -> bool {
    true
}

impl Config {
    /// Poll cycle period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Receive timeout for a single exchange
    pub fn rx_timeout(&self) -> Duration {
        Duration::from_millis(self.wire.rx_timeout_ms)
    }

    /// Check every value that the driver cannot operate with
    pub fn validate(&self) -> Result<()> {
        let wire = &self.wire;
        if wire.in_pin == wire.out_pin {
            return Err(Error::config(format!(
                "in_pin and out_pin must differ (both are {})",
                wire.in_pin
            )));
        }
        for (name, pin) in [("in_pin", wire.in_pin), ("out_pin", wire.out_pin)] {
            if pin > MAX_GPIO_PIN {
                return Err(Error::config(format!(
                    "{} {} is above the highest GPIO {}",
                    name, pin, MAX_GPIO_PIN
                )));
            }
        }
        if wire.rx_timeout_ms == 0 || wire.rx_timeout_ms > MAX_RX_TIMEOUT_MS {
            return Err(Error::config(format!(
                "rx_timeout_ms must be within 1..={} (got {})",
                MAX_RX_TIMEOUT_MS, wire.rx_timeout_ms
            )));
        }

        let polling = &self.polling;
        if polling.interval_ms == 0 {
            return Err(Error::config("polling.interval_ms must be positive"));
        }
        if wire.rx_timeout_ms >= polling.interval_ms {
            return Err(Error::config(format!(
                "rx_timeout_ms ({}) must be shorter than polling.interval_ms ({})",
                wire.rx_timeout_ms, polling.interval_ms
            )));
        }
        if polling.failure_threshold == 0 {
            return Err(Error::config("polling.failure_threshold must be positive"));
        }
        for entry in &polling.entries {
            if entry.interval_ms == 0 {
                return Err(Error::config(format!(
                    "poll entry for data-ID {} has a zero interval",
                    entry.data_id
                )));
            }
        }

        let eq = &self.equitherm;
        if ![eq.n, eq.k, eq.t, eq.feedback_gain].iter().all(|v| v.is_finite()) {
            return Err(Error::config("equitherm parameters must be finite"));
        }
        if eq.n <= 0.0 || eq.feedback_gain < 0.0 {
            return Err(Error::config(
                "equitherm.n must be positive and feedback_gain non-negative",
            ));
        }

        let limits = &self.limits;
        if !(limits.min_setpoint > 0.0 && limits.min_setpoint < limits.max_boiler_temp_heating) {
            return Err(Error::config(format!(
                "min_setpoint ({}) must be positive and below max_boiler_temp_heating ({})",
                limits.min_setpoint, limits.max_boiler_temp_heating
            )));
        }
        if limits.max_boiler_temp_heating > 100.0 || limits.max_dhw_temp > 100.0 {
            return Err(Error::config("temperature limits must not exceed 100 °C"));
        }
        if limits.max_dhw_temp <= 0.0 {
            return Err(Error::config("max_dhw_temp must be positive"));
        }
        if limits.emergency_setpoint < limits.min_setpoint
            || limits.emergency_setpoint > limits.max_boiler_temp_heating
        {
            return Err(Error::config(format!(
                "emergency_setpoint ({}) must lie within [{}, {}]",
                limits.emergency_setpoint, limits.min_setpoint, limits.max_boiler_temp_heating
            )));
        }
        if !(0.0..=100.0).contains(&limits.max_modulation) {
            return Err(Error::config("max_modulation must be a percentage"));
        }

        if !self.heating.target_indoor.is_finite()
            || !self.dhw.eco_temp.is_finite()
            || !self.dhw.normal_temp.is_finite()
        {
            return Err(Error::config("heating and DHW temperatures must be finite"));
        }

        Ok(())
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let mut config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        config.validate()?;

        info!(
            in_pin = config.wire.in_pin,
            out_pin = config.wire.out_pin,
            poll_ms = config.polling.interval_ms,
            rx_timeout_ms = config.wire.rx_timeout_ms,
            debug = config.wire.debug,
            "Configuration loaded successfully"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.wire.in_pin, 5);
        assert_eq!(config.wire.out_pin, 6);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.rx_timeout(), Duration::from_millis(40));
        assert!(!config.wire.debug);
        assert_eq!(config.polling.entries.len(), 9);
        assert_eq!(config.heating.compensation, CompensationMode::Equitherm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test_log::test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("opentherm.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [wire]
                in_pin = 12
                out_pin = 13
                rx_timeout_ms = 80
                debug = true

                [polling]
                interval_ms = 5000

                [equitherm]
                k = 1.2
                n = 1.0
                t = 20.0
                feedback_gain = 2.0

                [dhw]
                mode = "eco"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.wire.in_pin, 12);
        assert_eq!(config.wire.out_pin, 13);
        assert_eq!(config.wire.rx_timeout_ms, 80);
        assert!(config.wire.debug);
        assert_eq!(config.polling.interval_ms, 5000);
        assert_eq!(config.equitherm.k, 1.2);
        assert_eq!(config.equitherm.t, 20.0);
        assert_eq!(config.dhw.mode, DhwMode::Eco);
        assert_eq!(config.limits, LimitsConfig::default());

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("OTENVTEST__WIRE__RX_TIMEOUT_MS", "100");
        env::set_var("OTENVTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("otenvtest")
            .build()?;

        assert_eq!(config.wire.rx_timeout_ms, 100);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("OTENVTEST__WIRE__RX_TIMEOUT_MS");
        env::remove_var("OTENVTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_rejects_shared_pin() {
        let mut config = Config::default();
        config.wire.out_pin = config.wire.in_pin;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_pin_out_of_range() {
        let mut config = Config::default();
        config.wire.in_pin = 200;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_non_positive_intervals() {
        let mut config = Config::default();
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.wire.rx_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.entries[0].interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_timeout_longer_than_poll() {
        let mut config = Config::default();
        config.polling.interval_ms = 500;
        config.wire.rx_timeout_ms = 800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_emergency_outside_limits() {
        let mut config = Config::default();
        config.limits.emergency_setpoint = 95.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.min_setpoint = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_override_is_validated() {
        let mut bad = Config::default();
        bad.polling.failure_threshold = 0;
        let result = ConfigBuilder::new().override_with(bad).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
