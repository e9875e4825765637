//! Domain Layer - Core bookkeeping logic for FlowVault
//!
//! This module contains pure domain types and logic with no external
//! dependencies. All external interactions happen through the ports layer.
//!
//! - `types`: Shared identifiers and basis-point arithmetic
//! - `positions`: Per-user share accounting
//! - `registry`: Yield protocol catalog with capacity and ranking
//! - `asset_ledger`: Pooled deposits and virtual allocations per asset
//! - `allocator`: Pure planning of allocation, deallocation and moves
//! - `accountant`: Yield recognition, fee splits and settlement

pub mod accountant;
pub mod allocator;
pub mod asset_ledger;
pub mod positions;
pub mod registry;
pub mod types;

pub use accountant::{AccountingError, FeeSplit, YieldAccountant, YieldBreakdown};
pub use allocator::{AllocError, AllocationLeg, DeallocationLeg, RebalanceOpportunity};
pub use asset_ledger::{AssetLedger, AssetState, LedgerError};
pub use positions::{PositionError, SharePrice, UnitSharePrice, UserPosition, UserPositionStore};
pub use registry::{ProtocolInfo, ProtocolRegistry, RegistryError};
pub use types::{AssetId, ProtocolId, UserId, BPS_DENOMINATOR, MAX_RISK_SCORE};
