//! Yield Accountant
//!
//! Splits realized yield into protocol fee, treasury fee and net-to-pool
//! shares, accruing fees in ledger state. Nothing moves until `settle`, which
//! flushes pending fees through custody to the fee collector and is safe to
//! retry on shortfall.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::asset_ledger::{AssetLedger, LedgerError};
use crate::domain::registry::ProtocolRegistry;
use crate::domain::types::{bps_of, AssetId, ProtocolId, UserId, BPS_DENOMINATOR};
use crate::ports::custody::{CustodyError, TokenCustody};

#[derive(Debug, Error, Clone)]
pub enum AccountingError {
    #[error("invalid fee split: protocol {protocol_bps} + treasury {treasury_bps} exceeds {BPS_DENOMINATOR}")]
    InvalidFeeSplit { protocol_bps: u32, treasury_bps: u32 },

    #[error("settlement shortfall for {asset}: pending {pending}, custody holds {available}")]
    InsufficientSettlementBalance {
        asset: AssetId,
        pending: u64,
        available: u64,
    },

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Basis-point yield split; the net-to-pool share is the remainder, so the
/// three always sum to 10_000.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSplit {
    pub protocol_fee_bps: u32,
    pub treasury_fee_bps: u32,
}

impl FeeSplit {
    pub fn new(protocol_fee_bps: u32, treasury_fee_bps: u32) -> Result<Self, AccountingError> {
        // Widened sum: two caller-supplied u32s can overflow before the
        // bound check rejects them.
        if protocol_fee_bps as u64 + treasury_fee_bps as u64 > BPS_DENOMINATOR as u64 {
            return Err(AccountingError::InvalidFeeSplit {
                protocol_bps: protocol_fee_bps,
                treasury_bps: treasury_fee_bps,
            });
        }
        Ok(Self {
            protocol_fee_bps,
            treasury_fee_bps,
        })
    }

    pub fn net_bps(&self) -> u32 {
        BPS_DENOMINATOR - self.protocol_fee_bps - self.treasury_fee_bps
    }
}

/// How one yield amount was carved up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldBreakdown {
    pub protocol_fee: u64,
    pub treasury_fee: u64,
    pub net_to_pool: u64,
}

/// Accrues and settles yield against ledger state.
pub struct YieldAccountant {
    split: FeeSplit,
    fee_collector: UserId,
    custody: Arc<dyn TokenCustody>,
    /// Cumulative fees flushed per asset (audit counter)
    settled: HashMap<AssetId, u64>,
}

impl YieldAccountant {
    pub fn new(split: FeeSplit, fee_collector: UserId, custody: Arc<dyn TokenCustody>) -> Self {
        Self {
            split,
            fee_collector,
            custody,
            settled: HashMap::new(),
        }
    }

    /// Record realized yield: fee shares accrue as pending fees, the net
    /// share (including rounding dust) grows the pool. No token movement.
    pub fn record_yield(
        &self,
        ledger: &mut AssetLedger,
        asset: &AssetId,
        amount: u64,
    ) -> Result<YieldBreakdown, AccountingError> {
        if amount == 0 {
            return Ok(YieldBreakdown {
                protocol_fee: 0,
                treasury_fee: 0,
                net_to_pool: 0,
            });
        }
        let protocol_fee = bps_of(amount, self.split.protocol_fee_bps);
        let treasury_fee = bps_of(amount, self.split.treasury_fee_bps);
        let net_to_pool = amount - protocol_fee - treasury_fee;

        ledger.credit_yield(asset, net_to_pool, protocol_fee + treasury_fee)?;
        tracing::info!(
            "Yield {} {}: protocol fee {}, treasury fee {}, net {}",
            amount,
            asset,
            protocol_fee,
            treasury_fee,
            net_to_pool
        );
        Ok(YieldBreakdown {
            protocol_fee,
            treasury_fee,
            net_to_pool,
        })
    }

    /// Virtual return plus yield routing in one call: the protocol hands
    /// capital back and its realized yield is recorded.
    pub fn record_return(
        &self,
        ledger: &mut AssetLedger,
        registry: &mut ProtocolRegistry,
        protocol: &ProtocolId,
        asset: &AssetId,
        amount: u64,
        yield_generated: u64,
    ) -> Result<YieldBreakdown, AccountingError> {
        ledger.return_virtual(registry, protocol, asset, amount)?;
        self.record_yield(ledger, asset, yield_generated)
    }

    /// Flush pending fees to the fee collector if custody can cover them.
    /// On shortfall, fails with pending fees untouched; retry after the pool
    /// tops up. Settling with nothing pending is a no-op.
    pub async fn settle(
        &mut self,
        ledger: &mut AssetLedger,
        asset: &AssetId,
    ) -> Result<u64, AccountingError> {
        let pending = ledger
            .asset(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?
            .pending_fees;
        if pending == 0 {
            tracing::debug!("Settle {}: nothing pending", asset);
            return Ok(0);
        }

        let available = self.custody.balance_of(asset).await?;
        if available < pending {
            return Err(AccountingError::InsufficientSettlementBalance {
                asset: asset.clone(),
                pending,
                available,
            });
        }

        self.custody
            .transfer(asset, &self.fee_collector, pending)
            .await?;
        let flushed = ledger.clear_pending_fees(asset)?;
        *self.settled.entry(asset.clone()).or_insert(0) += flushed;
        tracing::info!("Settled {} {} in fees to {}", flushed, asset, self.fee_collector);
        Ok(flushed)
    }

    /// Cumulative fees flushed for an asset.
    pub fn total_settled(&self, asset: &AssetId) -> u64 {
        self.settled.get(asset).copied().unwrap_or(0)
    }
}
