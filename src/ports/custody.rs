//! Token Custody Port
//!
//! All real token movement happens behind this trait. The accounting core
//! only touches it at explicit settlement and withdraw boundaries; everything
//! else is virtual bookkeeping.

use thiserror::Error;

use crate::domain::types::{AssetId, UserId};

#[derive(Debug, Error, Clone)]
pub enum CustodyError {
    #[error("transfer failed for {asset}: {reason}")]
    TransferFailed { asset: AssetId, reason: String },
    #[error("custody balance query failed for {asset}: {reason}")]
    BalanceUnavailable { asset: AssetId, reason: String },
}

#[async_trait::async_trait]
pub trait TokenCustody: Send + Sync {
    /// Move tokens out of the pool to a recipient.
    async fn transfer(&self, asset: &AssetId, to: &UserId, amount: u64)
        -> Result<(), CustodyError>;

    /// Pull tokens from a depositor into the pool.
    async fn transfer_from(
        &self,
        asset: &AssetId,
        from: &UserId,
        amount: u64,
    ) -> Result<(), CustodyError>;

    /// Pool-held token balance for an asset.
    async fn balance_of(&self, asset: &AssetId) -> Result<u64, CustodyError>;
}
