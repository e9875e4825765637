//! Configuration Loader
//!
//! Loads and validates configuration from TOML files matching config.toml
//! structure. Every field has a default so the crate also works embedded
//! with `Config::default()`.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::domain::types::BPS_DENOMINATOR;

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub fees: FeesSection,
    #[serde(default)]
    pub rebalance: RebalanceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Ledger configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Create asset state on first deposit of an unknown asset
    pub auto_register_assets: bool,
    /// Idle threshold applied to auto-registered assets (base units)
    pub default_idle_threshold: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            auto_register_assets: true,
            default_idle_threshold: 1_000,
        }
    }
}

/// Yield fee split section; the net-to-pool share is the remainder of
/// 10_000 bps after both fees.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeesSection {
    pub protocol_fee_bps: u32,
    pub treasury_fee_bps: u32,
    /// Recipient of settled fees
    pub fee_collector: String,
}

impl Default for FeesSection {
    fn default() -> Self {
        Self {
            protocol_fee_bps: 500,
            treasury_fee_bps: 500,
            fee_collector: "fee-collector".to_string(),
        }
    }
}

/// Rebalancing policy section. The move fraction and yield threshold are
/// tuning knobs, not fixed law; product owns the values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebalanceSection {
    /// Minimum APY improvement to justify a move
    pub min_yield_delta_bps: u32,
    /// Fraction of a holding moved per opportunity (2500 = quarter)
    pub move_fraction_bps: u32,
    /// Minimum seconds between rebalances of one asset
    pub time_threshold_secs: u64,
    /// Execution-cost proxy ceiling (gas price); flows above it wait
    pub max_execution_cost: u64,
    /// Oracle observations older than this abort at analyze
    pub staleness_window_secs: u64,
    /// Per-flow deadline from trigger time
    pub flow_deadline_secs: u64,
    /// Max flows per batch invocation
    pub max_batch: usize,
    /// Terminal flows kept per asset for audit
    pub flow_history_per_asset: usize,
    /// Directory for flow history files
    pub data_dir: String,
}

impl Default for RebalanceSection {
    fn default() -> Self {
        Self {
            min_yield_delta_bps: 50,
            move_fraction_bps: 2_500,
            time_threshold_secs: 3_600,
            max_execution_cost: 1_000_000,
            staleness_window_secs: 300,
            flow_deadline_secs: 600,
            max_batch: 10,
            flow_history_per_asset: 50,
            data_dir: "data".to_string(),
        }
    }
}

impl RebalanceSection {
    /// Data directory with environment variable override
    /// (FLOWVAULT_DATA_DIR wins over the config value).
    pub fn get_data_dir(&self) -> String {
        std::env::var("FLOWVAULT_DATA_DIR").unwrap_or_else(|_| self.data_dir.clone())
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file. Pulls `.env` first so environment
/// overrides are visible to the section getters.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Widened sum so out-of-range file values cannot overflow the check
        if self.fees.protocol_fee_bps as u64 + self.fees.treasury_fee_bps as u64
            > BPS_DENOMINATOR as u64
        {
            return Err(ConfigError::ValidationError(format!(
                "fee splits must leave a non-negative pool share, got {} + {} bps",
                self.fees.protocol_fee_bps, self.fees.treasury_fee_bps
            )));
        }

        if self.fees.fee_collector.is_empty() {
            return Err(ConfigError::ValidationError(
                "fee_collector cannot be empty".to_string(),
            ));
        }

        if self.rebalance.move_fraction_bps == 0
            || self.rebalance.move_fraction_bps > BPS_DENOMINATOR
        {
            return Err(ConfigError::ValidationError(format!(
                "move_fraction_bps must be 1-{}, got {}",
                BPS_DENOMINATOR, self.rebalance.move_fraction_bps
            )));
        }

        if self.rebalance.max_batch == 0 {
            return Err(ConfigError::ValidationError(
                "max_batch must be > 0".to_string(),
            ));
        }

        if self.rebalance.staleness_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "staleness_window_secs must be > 0".to_string(),
            ));
        }

        if self.rebalance.flow_deadline_secs == 0 {
            return Err(ConfigError::ValidationError(
                "flow_deadline_secs must be > 0".to_string(),
            ));
        }

        if self.rebalance.flow_history_per_asset == 0 {
            return Err(ConfigError::ValidationError(
                "flow_history_per_asset must be > 0".to_string(),
            ));
        }

        if self.rebalance.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "data_dir cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [ledger]
            auto_register_assets = false
            default_idle_threshold = 5000

            [fees]
            protocol_fee_bps = 300
            treasury_fee_bps = 200
            fee_collector = "treasury-wallet"

            [rebalance]
            min_yield_delta_bps = 100
            move_fraction_bps = 1000
            time_threshold_secs = 7200
            max_execution_cost = 500000
            staleness_window_secs = 120
            flow_deadline_secs = 300
            max_batch = 5
            flow_history_per_asset = 25
            data_dir = "/var/lib/flowvault"

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert!(!config.ledger.auto_register_assets);
        assert_eq!(config.fees.protocol_fee_bps, 300);
        assert_eq!(config.rebalance.move_fraction_bps, 1_000);
        assert_eq!(config.rebalance.max_batch, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rebalance]
            min_yield_delta_bps = 25
        "#,
        )
        .unwrap();
        assert_eq!(config.rebalance.min_yield_delta_bps, 25);
        assert_eq!(config.rebalance.move_fraction_bps, 2_500);
        assert!(config.ledger.auto_register_assets);
    }

    #[test]
    fn test_fee_split_overflow_rejected() {
        let mut config = Config::default();
        config.fees.protocol_fee_bps = 6_000;
        config.fees.treasury_fee_bps = 5_000;
        assert!(config.validate().is_err());

        // Must reject, not wrap, when the raw sum exceeds u32::MAX
        config.fees.protocol_fee_bps = u32::MAX;
        config.fees.treasury_fee_bps = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_move_fraction_rejected() {
        let mut config = Config::default();
        config.rebalance.move_fraction_bps = 0;
        assert!(config.validate().is_err());

        config.rebalance.move_fraction_bps = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = Config::default();
        config.rebalance.max_batch = 0;
        assert!(config.validate().is_err());
    }
}
