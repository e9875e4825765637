//! Application layer: rebalance flows, their durable history, and the
//! engine that drives them.

pub mod archive;
pub mod engine;
pub mod flow;
