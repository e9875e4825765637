//! FlowVault - Multi-Asset Liquidity Ledger
//!
//! Virtual bookkeeping of pooled deposits allocated across yield protocols,
//! with a staged rebalancing engine moving capital toward better yields.
//!
//! # Modules
//!
//! - `domain`: Core business logic (AssetLedger, ProtocolRegistry, Allocator, YieldAccountant)
//! - `ports`: Trait abstractions (TokenCustody, PriceOracle, AccessControl)
//! - `application`: Rebalance flows, flow history, and the engine driving them
//! - `config`: Configuration loading, validation and live reload

pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
