//! Protocol Registry
//!
//! Catalog of yield venues with capacity, APY and risk score. Ranking is
//! served from a maintained sorted index (resorted on register/APY update)
//! instead of rescanning the whole catalog on every allocation decision.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::{ProtocolId, UserId, MAX_RISK_SCORE};
use crate::ports::access::{require_role, AccessControl, AccessError, Role};

#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("protocol {0} already registered")]
    DuplicateProtocol(ProtocolId),

    #[error("unknown protocol {0}")]
    UnknownProtocol(ProtocolId),

    #[error("risk score {0} out of range 0-{MAX_RISK_SCORE}")]
    RiskOutOfRange(u8),

    #[error("capacity exceeded on {protocol}: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        protocol: ProtocolId,
        requested: u64,
        remaining: u64,
    },

    #[error("allocation underflow on {protocol}: requested {requested}, allocated {allocated}")]
    AllocationUnderflow {
        protocol: ProtocolId,
        requested: u64,
        allocated: u64,
    },

    #[error(transparent)]
    Access(#[from] AccessError),
}

/// A registered yield venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol_id: ProtocolId,
    pub name: String,
    /// Current APY quote in bps
    pub current_apy_bps: u32,
    /// Hard cap on capital this venue may hold (all assets combined)
    pub max_capacity: u64,
    /// Capital currently allocated across all assets
    pub total_allocated: u64,
    /// 0 = safest, 100 = riskiest
    pub risk_score: u8,
    pub is_active: bool,
    /// Unix seconds of last APY refresh; never moves backwards
    pub last_update: u64,
}

impl ProtocolInfo {
    pub fn remaining_capacity(&self) -> u64 {
        self.max_capacity.saturating_sub(self.total_allocated)
    }
}

/// Registry of yield venues with a maintained yield-ranked index.
pub struct ProtocolRegistry {
    protocols: HashMap<ProtocolId, ProtocolInfo>,
    /// Protocol ids sorted by (APY desc, risk asc, id asc)
    ranked: Vec<ProtocolId>,
    access: Arc<dyn AccessControl>,
}

impl ProtocolRegistry {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self {
            protocols: HashMap::new(),
            ranked: Vec::new(),
            access,
        }
    }

    /// Register a new venue. Admin only; duplicate ids rejected.
    pub fn register(
        &mut self,
        caller: &UserId,
        protocol: ProtocolId,
        name: impl Into<String>,
        apy_bps: u32,
        max_capacity: u64,
        risk_score: u8,
        now: u64,
    ) -> Result<(), RegistryError> {
        require_role(self.access.as_ref(), caller, Role::Admin)?;
        if risk_score > MAX_RISK_SCORE {
            return Err(RegistryError::RiskOutOfRange(risk_score));
        }
        if self.protocols.contains_key(&protocol) {
            return Err(RegistryError::DuplicateProtocol(protocol));
        }

        let info = ProtocolInfo {
            protocol_id: protocol.clone(),
            name: name.into(),
            current_apy_bps: apy_bps,
            max_capacity,
            total_allocated: 0,
            risk_score,
            is_active: true,
            last_update: now,
        };
        tracing::info!(
            "Registered protocol {} (apy {} bps, capacity {}, risk {})",
            protocol,
            apy_bps,
            max_capacity,
            risk_score
        );
        self.protocols.insert(protocol.clone(), info);
        self.ranked.push(protocol);
        self.resort();
        Ok(())
    }

    /// Refresh a venue's APY quote. Keeper only; freshness is monotonic.
    pub fn update_apy(
        &mut self,
        caller: &UserId,
        protocol: &ProtocolId,
        apy_bps: u32,
        now: u64,
    ) -> Result<(), RegistryError> {
        require_role(self.access.as_ref(), caller, Role::Keeper)?;
        let info = self
            .protocols
            .get_mut(protocol)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol.clone()))?;
        let old = info.current_apy_bps;
        info.current_apy_bps = apy_bps;
        info.last_update = info.last_update.max(now);
        tracing::debug!("APY update {}: {} -> {} bps", protocol, old, apy_bps);
        self.resort();
        Ok(())
    }

    /// Activate or deactivate a venue. Admin only.
    pub fn set_active(
        &mut self,
        caller: &UserId,
        protocol: &ProtocolId,
        active: bool,
    ) -> Result<(), RegistryError> {
        require_role(self.access.as_ref(), caller, Role::Admin)?;
        let info = self
            .protocols
            .get_mut(protocol)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol.clone()))?;
        info.is_active = active;
        tracing::info!("Protocol {} active={}", protocol, active);
        Ok(())
    }

    /// Active venues ordered by APY descending, ties broken by lower risk
    /// score then lower protocol id. With `exclude_full` set, venues with no
    /// remaining capacity are filtered out.
    pub fn rank_by_yield(&self, exclude_full: bool) -> Vec<&ProtocolInfo> {
        self.ranked
            .iter()
            .filter_map(|id| self.protocols.get(id))
            .filter(|info| info.is_active)
            .filter(|info| !exclude_full || info.remaining_capacity() > 0)
            .collect()
    }

    pub fn get(&self, protocol: &ProtocolId) -> Option<&ProtocolInfo> {
        self.protocols.get(protocol)
    }

    pub fn remaining_capacity(&self, protocol: &ProtocolId) -> Result<u64, RegistryError> {
        self.protocols
            .get(protocol)
            .map(ProtocolInfo::remaining_capacity)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol.clone()))
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Record capital moving into a venue. Called by the ledger as part of a
    /// virtual allocation; rejects past capacity with no mutation.
    pub(crate) fn note_allocated(
        &mut self,
        protocol: &ProtocolId,
        amount: u64,
    ) -> Result<(), RegistryError> {
        let info = self
            .protocols
            .get_mut(protocol)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol.clone()))?;
        let remaining = info.remaining_capacity();
        if amount > remaining {
            return Err(RegistryError::CapacityExceeded {
                protocol: protocol.clone(),
                requested: amount,
                remaining,
            });
        }
        info.total_allocated += amount;
        Ok(())
    }

    /// Record capital leaving a venue.
    pub(crate) fn note_deallocated(
        &mut self,
        protocol: &ProtocolId,
        amount: u64,
    ) -> Result<(), RegistryError> {
        let info = self
            .protocols
            .get_mut(protocol)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol.clone()))?;
        if amount > info.total_allocated {
            return Err(RegistryError::AllocationUnderflow {
                protocol: protocol.clone(),
                requested: amount,
                allocated: info.total_allocated,
            });
        }
        info.total_allocated -= amount;
        Ok(())
    }

    fn resort(&mut self) {
        let protocols = &self.protocols;
        self.ranked.sort_by(|a, b| {
            let pa = &protocols[a];
            let pb = &protocols[b];
            pb.current_apy_bps
                .cmp(&pa.current_apy_bps)
                .then(pa.risk_score.cmp(&pb.risk_score))
                .then(pa.protocol_id.cmp(&pb.protocol_id))
        });
    }
}
