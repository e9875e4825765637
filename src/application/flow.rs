//! Rebalance Flow
//!
//! A staged, stateful workflow moving capital between yield venues:
//! Pending -> Analyzing -> Optimizing -> Executing -> Verifying -> terminal.
//! Cancellation is allowed from any non-terminal state. Once `ended_at` is
//! set the flow is immutable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::AssetId;

#[derive(Debug, Error, Clone)]
pub enum FlowError {
    #[error("invalid flow transition {from:?} -> {to:?}")]
    InvalidTransition { from: FlowStatus, to: FlowStatus },

    #[error("flow {0} is terminal and immutable")]
    Immutable(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Pending,
    Analyzing,
    Optimizing,
    Executing,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Succeeded | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    /// Legal forward transitions; Failed and Cancelled are reachable from
    /// any non-terminal state.
    fn next_stage(&self) -> Option<FlowStatus> {
        match self {
            FlowStatus::Pending => Some(FlowStatus::Analyzing),
            FlowStatus::Analyzing => Some(FlowStatus::Optimizing),
            FlowStatus::Optimizing => Some(FlowStatus::Executing),
            FlowStatus::Executing => Some(FlowStatus::Verifying),
            FlowStatus::Verifying => Some(FlowStatus::Succeeded),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, to: FlowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            FlowStatus::Failed | FlowStatus::Cancelled => true,
            _ => self.next_stage() == Some(to),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Analyze,
    Optimize,
    Execute,
    Verify,
}

/// One completed stage of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub kind: StepKind,
    pub detail: String,
    pub completed: bool,
    pub timestamp: u64,
}

/// A staged rebalance workflow for one asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceFlow {
    pub flow_id: u64,
    pub asset_id: AssetId,
    pub steps: Vec<FlowStep>,
    pub status: FlowStatus,
    /// Execution cost proxy captured at trigger time
    pub total_cost: u64,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    /// Execute must not proceed past this Unix time
    pub deadline: u64,
    pub error: Option<String>,
    /// Set when the move looked uneconomic at verify time
    pub needs_review: bool,
}

impl RebalanceFlow {
    pub fn new(flow_id: u64, asset_id: AssetId, total_cost: u64, now: u64, deadline: u64) -> Self {
        Self {
            flow_id,
            asset_id,
            steps: Vec::new(),
            status: FlowStatus::Pending,
            total_cost,
            started_at: now,
            ended_at: None,
            deadline,
            error: None,
            needs_review: false,
        }
    }

    /// Move to the next state, enforcing the lifecycle rules.
    pub fn advance(&mut self, to: FlowStatus, now: u64) -> Result<(), FlowError> {
        if self.ended_at.is_some() {
            return Err(FlowError::Immutable(self.flow_id));
        }
        if !self.status.can_transition_to(to) {
            return Err(FlowError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Record a completed stage.
    pub fn record_step(&mut self, kind: StepKind, detail: impl Into<String>, now: u64) {
        self.steps.push(FlowStep {
            kind,
            detail: detail.into(),
            completed: true,
            timestamp: now,
        });
    }

    /// Terminal failure with a captured reason.
    pub fn fail(&mut self, reason: impl Into<String>, now: u64) {
        let reason = reason.into();
        if self.advance(FlowStatus::Failed, now).is_ok() {
            self.error = Some(reason);
        }
    }

    /// External cancellation.
    pub fn cancel(&mut self, now: u64) -> Result<(), FlowError> {
        self.advance(FlowStatus::Cancelled, now)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn past_deadline(&self, now: u64) -> bool {
        now > self.deadline
    }
}

/// Summary returned to batch callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub flow_id: u64,
    pub asset_id: AssetId,
    pub status: FlowStatus,
    /// Capital moved by the execute step
    pub moved_amount: u64,
    pub needs_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> RebalanceFlow {
        RebalanceFlow::new(1, AssetId::from("USDC"), 10, 100, 1_000)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut f = flow();
        for status in [
            FlowStatus::Analyzing,
            FlowStatus::Optimizing,
            FlowStatus::Executing,
            FlowStatus::Verifying,
            FlowStatus::Succeeded,
        ] {
            f.advance(status, 200).unwrap();
        }
        assert!(f.is_terminal());
        assert_eq!(f.ended_at, Some(200));
    }

    #[test]
    fn test_stage_skip_rejected() {
        let mut f = flow();
        let result = f.advance(FlowStatus::Executing, 200);
        assert!(matches!(result, Err(FlowError::InvalidTransition { .. })));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        let mut f = flow();
        f.advance(FlowStatus::Analyzing, 150).unwrap();
        f.advance(FlowStatus::Optimizing, 160).unwrap();
        f.cancel(170).unwrap();
        assert_eq!(f.status, FlowStatus::Cancelled);
        assert_eq!(f.ended_at, Some(170));
    }

    #[test]
    fn test_terminal_flow_is_immutable() {
        let mut f = flow();
        f.advance(FlowStatus::Analyzing, 150).unwrap();
        f.fail("stale data", 160);
        assert_eq!(f.status, FlowStatus::Failed);
        assert_eq!(f.error.as_deref(), Some("stale data"));

        assert!(matches!(
            f.advance(FlowStatus::Analyzing, 170),
            Err(FlowError::Immutable(1))
        ));
        assert!(f.cancel(170).is_err());
    }

    #[test]
    fn test_fail_from_any_stage() {
        let mut f = flow();
        f.advance(FlowStatus::Analyzing, 150).unwrap();
        f.advance(FlowStatus::Optimizing, 151).unwrap();
        f.advance(FlowStatus::Executing, 152).unwrap();
        f.fail("deadline exceeded", 153);
        assert_eq!(f.status, FlowStatus::Failed);
        assert_eq!(f.ended_at, Some(153));
    }

    #[test]
    fn test_steps_recorded_in_order() {
        let mut f = flow();
        f.record_step(StepKind::Analyze, "data fresh", 150);
        f.record_step(StepKind::Optimize, "move 100 P1->P2", 151);
        assert_eq!(f.steps.len(), 2);
        assert_eq!(f.steps[0].kind, StepKind::Analyze);
        assert!(f.steps.iter().all(|s| s.completed));
    }

    #[test]
    fn test_deadline_check() {
        let f = flow();
        assert!(!f.past_deadline(1_000));
        assert!(f.past_deadline(1_001));
    }
}
