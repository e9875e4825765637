//! Configuration
//!
//! TOML-backed configuration with validation before use. Runtime updates go
//! through [`ConfigHandle`], which swaps the whole validated struct in one
//! assignment; readers never observe a half-applied change.

mod loader;

pub use loader::{
    load_config, Config, ConfigError, FeesSection, LedgerSection, LoggingSection,
    RebalanceSection,
};

use std::sync::{Arc, RwLock};

use tracing_subscriber::{fmt, EnvFilter};

/// Shared handle to the live configuration.
///
/// Cloning is cheap; `current()` returns an immutable snapshot so a flow in
/// progress keeps the policy it started with even across a swap.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Immutable snapshot of the current configuration.
    pub fn current(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Validate and atomically swap in a new configuration. On validation
    /// failure the previous configuration stays in effect untouched.
    pub fn replace(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
        tracing::info!("Configuration swapped");
        Ok(())
    }
}

/// Initialize tracing with an env-filter level ("info", "debug", ...).
/// `RUST_LOG` takes precedence when set.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_snapshot_survives_swap() {
        let handle = ConfigHandle::new(Config::default()).unwrap();
        let before = handle.current();

        let mut updated = Config::default();
        updated.rebalance.min_yield_delta_bps = 75;
        handle.replace(updated).unwrap();

        // The old snapshot is unchanged; new reads see the swap
        assert_ne!(
            before.rebalance.min_yield_delta_bps,
            handle.current().rebalance.min_yield_delta_bps
        );
        assert_eq!(handle.current().rebalance.min_yield_delta_bps, 75);
    }

    #[test]
    fn test_invalid_swap_keeps_previous() {
        let handle = ConfigHandle::new(Config::default()).unwrap();
        let mut bad = Config::default();
        bad.fees.protocol_fee_bps = 9_000;
        bad.fees.treasury_fee_bps = 9_000;

        assert!(handle.replace(bad).is_err());
        // Previous config still in effect
        assert!(handle.current().fees.protocol_fee_bps + handle.current().fees.treasury_fee_bps <= 10_000);
    }
}
