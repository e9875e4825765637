//! In-memory port implementations for tests and paper runs.
//!
//! Mocks record calls and serve controlled responses so engine behavior can
//! be exercised deterministically with no external services.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::types::{now_secs, AssetId, ProtocolId, UserId};
use crate::ports::access::{AccessControl, Role};
use crate::ports::custody::{CustodyError, TokenCustody};
use crate::ports::oracle::{OracleError, PoolSnapshot, PriceOracle};

/// Recorded outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub asset: AssetId,
    pub to: UserId,
    pub amount: u64,
}

/// Mock custody with settable balances; records every transfer.
#[derive(Debug, Default)]
pub struct MockCustody {
    balances: Arc<Mutex<HashMap<AssetId, u64>>>,
    transfers: Arc<Mutex<Vec<RecordedTransfer>>>,
    fail_transfers: Arc<Mutex<bool>>,
}

impl MockCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the pool-held balance for an asset.
    pub fn with_balance(self, asset: &str, amount: u64) -> Self {
        self.balances
            .lock()
            .unwrap()
            .insert(AssetId::from(asset), amount);
        self
    }

    pub fn set_balance(&self, asset: &AssetId, amount: u64) {
        self.balances.lock().unwrap().insert(asset.clone(), amount);
    }

    /// Force all subsequent transfers to fail.
    pub fn set_fail_transfers(&self, fail: bool) {
        *self.fail_transfers.lock().unwrap() = fail;
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.transfers.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenCustody for MockCustody {
    async fn transfer(
        &self,
        asset: &AssetId,
        to: &UserId,
        amount: u64,
    ) -> Result<(), CustodyError> {
        if *self.fail_transfers.lock().unwrap() {
            return Err(CustodyError::TransferFailed {
                asset: asset.clone(),
                reason: "forced failure".to_string(),
            });
        }
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(asset.clone()).or_insert(0);
        if *balance < amount {
            return Err(CustodyError::TransferFailed {
                asset: asset.clone(),
                reason: format!("balance {} < transfer {}", balance, amount),
            });
        }
        *balance -= amount;
        self.transfers.lock().unwrap().push(RecordedTransfer {
            asset: asset.clone(),
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    async fn transfer_from(
        &self,
        asset: &AssetId,
        _from: &UserId,
        amount: u64,
    ) -> Result<(), CustodyError> {
        if *self.fail_transfers.lock().unwrap() {
            return Err(CustodyError::TransferFailed {
                asset: asset.clone(),
                reason: "forced failure".to_string(),
            });
        }
        *self
            .balances
            .lock()
            .unwrap()
            .entry(asset.clone())
            .or_insert(0) += amount;
        Ok(())
    }

    async fn balance_of(&self, asset: &AssetId) -> Result<u64, CustodyError> {
        Ok(*self.balances.lock().unwrap().get(asset).unwrap_or(&0))
    }
}

/// Mock oracle serving configured APYs and pool snapshots.
#[derive(Debug, Default)]
pub struct MockOracle {
    apys: Arc<Mutex<HashMap<(ProtocolId, AssetId), u32>>>,
    snapshots: Arc<Mutex<HashMap<AssetId, PoolSnapshot>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: configure an APY quote.
    pub fn with_apy(self, protocol: &str, asset: &str, apy_bps: u32) -> Self {
        self.apys
            .lock()
            .unwrap()
            .insert((ProtocolId::from(protocol), AssetId::from(asset)), apy_bps);
        self
    }

    /// Builder: configure a fresh pool snapshot taken now.
    pub fn with_fresh_snapshot(self, asset: &str) -> Self {
        self.set_snapshot(PoolSnapshot {
            asset_id: AssetId::from(asset),
            tick: 0,
            volatility_bps: 120,
            volume: 1_000_000,
            observed_at: now_secs(),
        });
        self
    }

    pub fn set_snapshot(&self, snapshot: PoolSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.asset_id.clone(), snapshot);
    }

    /// Age the stored snapshot for an asset by `secs`.
    pub fn age_snapshot(&self, asset: &AssetId, secs: u64) {
        if let Some(snapshot) = self.snapshots.lock().unwrap().get_mut(asset) {
            snapshot.observed_at = snapshot.observed_at.saturating_sub(secs);
        }
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn get_apy(&self, protocol: &ProtocolId, asset: &AssetId) -> Result<u32, OracleError> {
        self.apys
            .lock()
            .unwrap()
            .get(&(protocol.clone(), asset.clone()))
            .copied()
            .ok_or_else(|| OracleError::UnknownProtocol(protocol.clone()))
    }

    async fn get_pool_snapshot(&self, asset: &AssetId) -> Result<PoolSnapshot, OracleError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(asset)
            .cloned()
            .ok_or_else(|| OracleError::UnknownAsset(asset.clone()))
    }
}

/// Static role table; grant roles up front, check synchronously.
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    grants: Mutex<HashMap<UserId, HashSet<Role>>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: grant a role to a caller.
    pub fn with_role(self, caller: &str, role: Role) -> Self {
        self.grants
            .lock()
            .unwrap()
            .entry(UserId::from(caller))
            .or_default()
            .insert(role);
        self
    }
}

impl AccessControl for StaticAccessControl {
    fn has_role(&self, caller: &UserId, role: Role) -> bool {
        self.grants
            .lock()
            .unwrap()
            .get(caller)
            .map_or(false, |roles| roles.contains(&role))
    }
}

/// Access control that grants every role to every caller (test shortcut).
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn has_role(&self, _caller: &UserId, _role: Role) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_custody_transfer_reduces_balance() {
        let custody = MockCustody::new().with_balance("USDC", 1_000);
        let asset = AssetId::from("USDC");
        let collector = UserId::from("collector");

        custody.transfer(&asset, &collector, 400).await.unwrap();
        assert_eq!(custody.balance_of(&asset).await.unwrap(), 600);
        assert_eq!(custody.transfers().len(), 1);
        assert_eq!(custody.transfers()[0].amount, 400);
    }

    #[tokio::test]
    async fn test_mock_custody_rejects_overdraft() {
        let custody = MockCustody::new().with_balance("USDC", 100);
        let result = custody
            .transfer(&AssetId::from("USDC"), &UserId::from("x"), 200)
            .await;
        assert!(result.is_err());
        assert_eq!(custody.transfers().len(), 0);
    }

    #[tokio::test]
    async fn test_mock_oracle_snapshot_aging() {
        let oracle = MockOracle::new().with_fresh_snapshot("USDC");
        let asset = AssetId::from("USDC");

        let fresh = oracle.get_pool_snapshot(&asset).await.unwrap();
        assert!(fresh.age_secs(now_secs()) < 2);

        oracle.age_snapshot(&asset, 600);
        let stale = oracle.get_pool_snapshot(&asset).await.unwrap();
        assert!(stale.age_secs(now_secs()) >= 600);
    }

    #[test]
    fn test_static_access_control() {
        let access = StaticAccessControl::new().with_role("ops", Role::Keeper);
        assert!(access.has_role(&UserId::from("ops"), Role::Keeper));
        assert!(!access.has_role(&UserId::from("ops"), Role::Admin));
        assert!(!access.has_role(&UserId::from("rando"), Role::Keeper));
    }
}
