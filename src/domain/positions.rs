//! User Position Store
//!
//! Per-(user, asset) deposit accounting. Positions are mutated only through
//! ledger deposit/withdraw; everything else reads. Shares are 1:1 with
//! deposited amounts in the base model, with the conversion behind a trait so
//! a yield-bearing share price can plug in later.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::{AssetId, UserId};

#[derive(Debug, Error, Clone)]
pub enum PositionError {
    #[error("insufficient balance: have {have}, requested {requested}")]
    InsufficientBalance { have: u64, requested: u64 },
}

/// Share/amount conversion policy.
pub trait SharePrice: Send + Sync {
    fn shares_for_amount(&self, amount: u64) -> u64;
    fn amount_for_shares(&self, shares: u64) -> u64;
}

/// Base model: one share per base unit deposited.
#[derive(Debug, Default)]
pub struct UnitSharePrice;

impl SharePrice for UnitSharePrice {
    fn shares_for_amount(&self, amount: u64) -> u64 {
        amount
    }

    fn amount_for_shares(&self, shares: u64) -> u64 {
        shares
    }
}

/// A user's standing in one asset pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPosition {
    pub user_id: UserId,
    pub asset_id: AssetId,
    /// Cumulative deposited (audit counter, never decremented)
    pub deposited: u64,
    /// Cumulative withdrawn (audit counter)
    pub withdrawn: u64,
    /// Live share balance
    pub shares: u64,
    /// Unix seconds of last deposit or withdraw
    pub last_interaction: u64,
}

/// Store owning all user positions.
pub struct UserPositionStore {
    positions: HashMap<(UserId, AssetId), UserPosition>,
    share_price: Box<dyn SharePrice>,
}

impl Default for UserPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserPositionStore {
    pub fn new() -> Self {
        Self::with_share_price(Box::new(UnitSharePrice))
    }

    pub fn with_share_price(share_price: Box<dyn SharePrice>) -> Self {
        Self {
            positions: HashMap::new(),
            share_price,
        }
    }

    /// Credit a deposit, returning the shares minted.
    pub fn record_deposit(&mut self, user: &UserId, asset: &AssetId, amount: u64, now: u64) -> u64 {
        let shares = self.share_price.shares_for_amount(amount);
        let position = self
            .positions
            .entry((user.clone(), asset.clone()))
            .or_insert_with(|| UserPosition {
                user_id: user.clone(),
                asset_id: asset.clone(),
                deposited: 0,
                withdrawn: 0,
                shares: 0,
                last_interaction: now,
            });
        position.deposited += amount;
        position.shares += shares;
        position.last_interaction = now;
        shares
    }

    /// Debit a withdrawal, returning the shares burned. No mutation on error.
    pub fn record_withdraw(
        &mut self,
        user: &UserId,
        asset: &AssetId,
        amount: u64,
        now: u64,
    ) -> Result<u64, PositionError> {
        let shares = self.share_price.shares_for_amount(amount);
        let position = self
            .positions
            .get_mut(&(user.clone(), asset.clone()))
            .ok_or(PositionError::InsufficientBalance {
                have: 0,
                requested: amount,
            })?;
        if position.shares < shares {
            return Err(PositionError::InsufficientBalance {
                have: self.share_price.amount_for_shares(position.shares),
                requested: amount,
            });
        }
        position.shares -= shares;
        position.withdrawn += amount;
        position.last_interaction = now;
        Ok(shares)
    }

    /// Withdrawable balance in base units.
    pub fn balance(&self, user: &UserId, asset: &AssetId) -> u64 {
        self.positions
            .get(&(user.clone(), asset.clone()))
            .map(|p| self.share_price.amount_for_shares(p.shares))
            .unwrap_or(0)
    }

    pub fn position(&self, user: &UserId, asset: &AssetId) -> Option<&UserPosition> {
        self.positions.get(&(user.clone(), asset.clone()))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> AssetId {
        AssetId::from("USDC")
    }

    fn alice() -> UserId {
        UserId::from("alice")
    }

    #[test]
    fn test_deposit_mints_unit_shares() {
        let mut store = UserPositionStore::new();
        let shares = store.record_deposit(&alice(), &usdc(), 1_000, 100);
        assert_eq!(shares, 1_000);
        assert_eq!(store.balance(&alice(), &usdc()), 1_000);

        let position = store.position(&alice(), &usdc()).unwrap();
        assert_eq!(position.deposited, 1_000);
        assert_eq!(position.withdrawn, 0);
        assert_eq!(position.last_interaction, 100);
    }

    #[test]
    fn test_withdraw_burns_shares_and_tracks_cumulative() {
        let mut store = UserPositionStore::new();
        store.record_deposit(&alice(), &usdc(), 1_000, 100);

        let burned = store.record_withdraw(&alice(), &usdc(), 400, 200).unwrap();
        assert_eq!(burned, 400);
        assert_eq!(store.balance(&alice(), &usdc()), 600);

        let position = store.position(&alice(), &usdc()).unwrap();
        assert_eq!(position.deposited, 1_000);
        assert_eq!(position.withdrawn, 400);
        assert_eq!(position.last_interaction, 200);
    }

    #[test]
    fn test_overdraw_rejected_without_mutation() {
        let mut store = UserPositionStore::new();
        store.record_deposit(&alice(), &usdc(), 100, 100);

        let result = store.record_withdraw(&alice(), &usdc(), 200, 200);
        assert!(matches!(
            result,
            Err(PositionError::InsufficientBalance {
                have: 100,
                requested: 200
            })
        ));
        assert_eq!(store.balance(&alice(), &usdc()), 100);
        assert_eq!(store.position(&alice(), &usdc()).unwrap().last_interaction, 100);
    }

    #[test]
    fn test_unknown_position_withdraw() {
        let mut store = UserPositionStore::new();
        let result = store.record_withdraw(&alice(), &usdc(), 1, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_positions_isolated_per_asset() {
        let mut store = UserPositionStore::new();
        store.record_deposit(&alice(), &usdc(), 500, 100);
        store.record_deposit(&alice(), &AssetId::from("SOL"), 300, 100);

        assert_eq!(store.balance(&alice(), &usdc()), 500);
        assert_eq!(store.balance(&alice(), &AssetId::from("SOL")), 300);
        assert_eq!(store.len(), 2);
    }
}
