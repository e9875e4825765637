//! Access Control Port
//!
//! Role checks for privileged operations. The actual policy (multisig, RBAC
//! contract, static allowlist) lives behind this trait; the core only asks
//! "does caller hold role".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::UserId;

/// Roles recognized by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Protocol registration, config swaps, emergency mode
    Admin,
    /// APY refresh and rebalance triggering
    Keeper,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Keeper => "keeper",
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AccessError {
    #[error("unauthorized: {caller} lacks role {role}")]
    Unauthorized { caller: UserId, role: &'static str },
}

pub trait AccessControl: Send + Sync {
    fn has_role(&self, caller: &UserId, role: Role) -> bool;
}

/// Check `caller` for `role`, producing `Unauthorized` on failure.
pub fn require_role(
    access: &dyn AccessControl,
    caller: &UserId,
    role: Role,
) -> Result<(), AccessError> {
    if access.has_role(caller, role) {
        Ok(())
    } else {
        Err(AccessError::Unauthorized {
            caller: caller.clone(),
            role: role.name(),
        })
    }
}
