//! Asset Ledger
//!
//! Per-asset accounting: deposits, virtual protocol allocations, utilization
//! and pending fees. Protocols draw on pooled capital through bookkeeping
//! only; no tokens move here. Real transfers happen behind the custody port
//! at the explicit settlement and withdraw boundaries.
//!
//! Accounting identity, held after every mutation:
//! `total_deposited == available + total_utilized`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::allocator;
use crate::domain::positions::{PositionError, UserPositionStore};
use crate::domain::registry::{ProtocolRegistry, RegistryError};
use crate::domain::types::{AssetId, ProtocolId, UserId};

#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("unsupported asset {0}")]
    UnsupportedAsset(AssetId),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error("insufficient liquidity for {asset}: requested {requested}, coverable {coverable}")]
    InsufficientLiquidity {
        asset: AssetId,
        requested: u64,
        coverable: u64,
    },

    #[error("allocation underflow: {protocol}/{asset} holds {allocated}, requested {requested}")]
    AllocationUnderflow {
        protocol: ProtocolId,
        asset: AssetId,
        requested: u64,
        allocated: u64,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Per-asset ledger state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetState {
    pub asset_id: AssetId,
    /// Pool-owned capital in base units
    pub total_deposited: u64,
    /// Capital virtually allocated to protocols
    pub total_utilized: u64,
    /// Idle capital at or above this triggers rebalancing
    pub idle_threshold: u64,
    /// Accrued fees awaiting settlement
    pub pending_fees: u64,
    pub auto_rebalance_enabled: bool,
    /// Unix seconds of the last completed rebalance
    pub last_rebalance_time: u64,
}

impl AssetState {
    /// Deposited capital not allocated to any protocol (idle capital).
    pub fn available(&self) -> u64 {
        self.total_deposited.saturating_sub(self.total_utilized)
    }
}

/// The multi-asset accounting ledger.
///
/// Owns asset states, the (protocol, asset) allocation relation and the user
/// position store. Allocation capacity lives in the registry, so joint
/// mutations take `&mut ProtocolRegistry` and keep both sides consistent.
pub struct AssetLedger {
    assets: HashMap<AssetId, AssetState>,
    /// allocation relation: asset -> protocol -> amount (BTreeMap for
    /// deterministic iteration order)
    allocations: HashMap<AssetId, BTreeMap<ProtocolId, u64>>,
    positions: UserPositionStore,
    auto_register_assets: bool,
    default_idle_threshold: u64,
}

impl AssetLedger {
    pub fn new(auto_register_assets: bool, default_idle_threshold: u64) -> Self {
        Self {
            assets: HashMap::new(),
            allocations: HashMap::new(),
            positions: UserPositionStore::new(),
            auto_register_assets,
            default_idle_threshold,
        }
    }

    /// Add an asset with the given idle threshold; no-op if already present.
    pub fn register_asset(&mut self, asset: &AssetId, idle_threshold: u64) {
        self.assets.entry(asset.clone()).or_insert_with(|| {
            tracing::info!("Asset {} registered (idle threshold {})", asset, idle_threshold);
            AssetState {
                asset_id: asset.clone(),
                total_deposited: 0,
                total_utilized: 0,
                idle_threshold,
                pending_fees: 0,
                auto_rebalance_enabled: true,
                last_rebalance_time: 0,
            }
        });
    }

    /// Credit a user deposit, returning minted shares.
    pub fn deposit(
        &mut self,
        asset: &AssetId,
        amount: u64,
        user: &UserId,
        now: u64,
    ) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if !self.assets.contains_key(asset) {
            if !self.auto_register_assets {
                return Err(LedgerError::UnsupportedAsset(asset.clone()));
            }
            let threshold = self.default_idle_threshold;
            self.register_asset(asset, threshold);
        }

        let state = self.assets.get_mut(asset).expect("asset registered above");
        state.total_deposited += amount;
        let shares = self.positions.record_deposit(user, asset, amount, now);

        tracing::info!("Deposit {} {} by {} ({} shares)", amount, asset, user, shares);
        self.debug_check(asset);
        Ok(shares)
    }

    /// Debit a user withdrawal.
    ///
    /// If available capital is short, deallocates from the lowest-yield
    /// protocols first to cover the shortfall. All-or-nothing: when protocols
    /// cannot supply enough, fails `InsufficientLiquidity` with no mutation.
    /// The caller transfers tokens out through custody after this succeeds.
    pub fn withdraw(
        &mut self,
        registry: &mut ProtocolRegistry,
        asset: &AssetId,
        amount: u64,
        user: &UserId,
        now: u64,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let state = self
            .assets
            .get(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;

        let balance = self.positions.balance(user, asset);
        if balance < amount {
            return Err(PositionError::InsufficientBalance {
                have: balance,
                requested: amount,
            }
            .into());
        }

        // Plan shortfall coverage before touching anything.
        let shortfall = amount.saturating_sub(state.available());
        let plan = if shortfall > 0 {
            allocator::plan_deallocation(self, registry, asset, shortfall)?
        } else {
            Vec::new()
        };

        for leg in &plan {
            self.apply_deallocation(registry, &leg.protocol, asset, leg.amount)?;
            tracing::debug!(
                "Withdraw cover: deallocated {} {} from {}",
                leg.amount,
                asset,
                leg.protocol
            );
        }

        self.positions.record_withdraw(user, asset, amount, now)?;
        let state = self.assets.get_mut(asset).expect("asset checked above");
        state.total_deposited -= amount;

        tracing::info!("Withdraw {} {} by {}", amount, asset, user);
        self.debug_check(asset);
        Ok(())
    }

    /// Virtual allocation: a protocol draws pooled capital, bookkeeping only.
    ///
    /// `user` is the end-user the protocol is acting for, recorded for audit.
    pub fn access_virtual(
        &mut self,
        registry: &mut ProtocolRegistry,
        protocol: &ProtocolId,
        asset: &AssetId,
        amount: u64,
        user: &UserId,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let state = self
            .assets
            .get(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        let available = state.available();
        if amount > available {
            return Err(LedgerError::InsufficientLiquidity {
                asset: asset.clone(),
                requested: amount,
                coverable: available,
            });
        }

        // Capacity check mutates the registry only on success.
        registry.note_allocated(protocol, amount)?;

        let state = self.assets.get_mut(asset).expect("asset checked above");
        state.total_utilized += amount;
        *self
            .allocations
            .entry(asset.clone())
            .or_default()
            .entry(protocol.clone())
            .or_insert(0) += amount;

        tracing::info!(
            "Virtual access: {} {} -> {} (for {})",
            amount,
            asset,
            protocol,
            user
        );
        self.debug_check(asset);
        Ok(())
    }

    /// Virtual return: a protocol hands capital back, bookkeeping only.
    ///
    /// Realized yield is routed separately through the accountant, which
    /// splits fees and credits the pool.
    pub fn return_virtual(
        &mut self,
        registry: &mut ProtocolRegistry,
        protocol: &ProtocolId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.apply_deallocation(registry, protocol, asset, amount)?;
        tracing::info!("Virtual return: {} {} <- {}", amount, asset, protocol);
        self.debug_check(asset);
        Ok(())
    }

    fn apply_deallocation(
        &mut self,
        registry: &mut ProtocolRegistry,
        protocol: &ProtocolId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let allocated = self.allocation(protocol, asset);
        if amount > allocated {
            return Err(LedgerError::AllocationUnderflow {
                protocol: protocol.clone(),
                asset: asset.clone(),
                requested: amount,
                allocated,
            });
        }
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;

        registry.note_deallocated(protocol, amount)?;
        state.total_utilized -= amount;

        let per_asset = self.allocations.get_mut(asset).expect("allocation exists");
        let entry = per_asset.get_mut(protocol).expect("allocation exists");
        *entry -= amount;
        if *entry == 0 {
            per_asset.remove(protocol);
        }
        Ok(())
    }

    /// Credit realized yield: net share grows the pool, fee share accrues
    /// for settlement. Called by the accountant only.
    pub(crate) fn credit_yield(
        &mut self,
        asset: &AssetId,
        net: u64,
        fees: u64,
    ) -> Result<(), LedgerError> {
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        state.total_deposited += net;
        state.pending_fees += fees;
        self.debug_check(asset);
        Ok(())
    }

    /// Zero out pending fees, returning the flushed amount. Called by the
    /// accountant once the matching custody transfer has gone through.
    pub(crate) fn clear_pending_fees(&mut self, asset: &AssetId) -> Result<u64, LedgerError> {
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        Ok(std::mem::take(&mut state.pending_fees))
    }

    pub fn asset(&self, asset: &AssetId) -> Option<&AssetState> {
        self.assets.get(asset)
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetState> {
        self.assets.values()
    }

    /// Idle (non-utilized) capital for an asset.
    pub fn available(&self, asset: &AssetId) -> u64 {
        self.assets.get(asset).map(AssetState::available).unwrap_or(0)
    }

    pub fn allocation(&self, protocol: &ProtocolId, asset: &AssetId) -> u64 {
        self.allocations
            .get(asset)
            .and_then(|m| m.get(protocol))
            .copied()
            .unwrap_or(0)
    }

    /// Per-protocol allocations for an asset, in protocol-id order.
    pub fn allocations_for(&self, asset: &AssetId) -> Vec<(ProtocolId, u64)> {
        self.allocations
            .get(asset)
            .map(|m| m.iter().map(|(p, a)| (p.clone(), *a)).collect())
            .unwrap_or_default()
    }

    pub fn positions(&self) -> &UserPositionStore {
        &self.positions
    }

    pub fn set_auto_rebalance(&mut self, asset: &AssetId, enabled: bool) -> Result<(), LedgerError> {
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        state.auto_rebalance_enabled = enabled;
        Ok(())
    }

    pub fn set_idle_threshold(&mut self, asset: &AssetId, threshold: u64) -> Result<(), LedgerError> {
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        state.idle_threshold = threshold;
        Ok(())
    }

    /// Stamp a completed rebalance (monotonic).
    pub fn mark_rebalanced(&mut self, asset: &AssetId, now: u64) -> Result<(), LedgerError> {
        let state = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LedgerError::UnsupportedAsset(asset.clone()))?;
        state.last_rebalance_time = state.last_rebalance_time.max(now);
        Ok(())
    }

    /// Verify the accounting identity and allocation-sum consistency for an
    /// asset. Used by the engine's verify step and by tests.
    pub fn verify_identity(&self, asset: &AssetId) -> bool {
        let Some(state) = self.assets.get(asset) else {
            return false;
        };
        let allocation_sum: u64 = self
            .allocations
            .get(asset)
            .map(|m| m.values().sum())
            .unwrap_or(0);
        state.total_utilized <= state.total_deposited
            && allocation_sum == state.total_utilized
            && state.total_deposited == state.available() + state.total_utilized
    }

    fn debug_check(&self, asset: &AssetId) {
        debug_assert!(self.verify_identity(asset), "ledger identity broken for {asset}");
    }
}
