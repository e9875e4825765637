//! Ports Layer - Trait definitions for external collaborators
//!
//! Following hexagonal architecture, these traits abstract everything the
//! accounting core must not own:
//! - Token custody (the only place real tokens move)
//! - Price/yield oracle data with freshness
//! - Role-based access control

pub mod access;
pub mod custody;
pub mod mocks;
pub mod oracle;
