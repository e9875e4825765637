//! Price / Yield Oracle Port
//!
//! Read-only market data: per-protocol APY quotes and pool snapshots with a
//! freshness timestamp. The rebalance engine rejects snapshots older than its
//! configured staleness window rather than blocking on a refresh.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::{AssetId, ProtocolId};

#[derive(Debug, Error, Clone)]
pub enum OracleError {
    #[error("no data for protocol {0}")]
    UnknownProtocol(ProtocolId),
    #[error("no pool snapshot for {0}")]
    UnknownAsset(AssetId),
    #[error("oracle query failed: {0}")]
    QueryFailed(String),
}

/// Point-in-time pool observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub asset_id: AssetId,
    /// Current pool tick (range-suggestion input)
    pub tick: i32,
    /// Recent volatility in bps
    pub volatility_bps: u32,
    /// Recent volume in base units
    pub volume: u64,
    /// Unix seconds when this observation was taken
    pub observed_at: u64,
}

impl PoolSnapshot {
    /// Age of the snapshot relative to `now` (saturating)
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.observed_at)
    }
}

#[async_trait::async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current APY quote for a protocol/asset pair, in bps.
    async fn get_apy(&self, protocol: &ProtocolId, asset: &AssetId) -> Result<u32, OracleError>;

    /// Latest pool observation for an asset.
    async fn get_pool_snapshot(&self, asset: &AssetId) -> Result<PoolSnapshot, OracleError>;
}
