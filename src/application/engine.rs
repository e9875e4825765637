//! Rebalance Engine
//!
//! Orchestrates staged rebalance flows over allocator decisions: analyze
//! (data freshness, cost ceiling), optimize (pick a concrete move), execute
//! (deallocate-then-allocate as one logical unit with compensation on
//! partial failure), verify (post-conditions and economics).
//!
//! Flows for different assets run independently; flows for the same asset
//! serialize on a per-asset advisory lock held from Analyzing to
//! termination. A cancellation flag is checked before every step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::application::archive::{ArchiveError, FlowArchive};
use crate::application::flow::{FlowError, FlowOutcome, FlowStatus, RebalanceFlow, StepKind};
use crate::config::ConfigHandle;
use crate::domain::allocator::{self, AllocationLeg};
use crate::domain::asset_ledger::{AssetLedger, LedgerError};
use crate::domain::registry::ProtocolRegistry;
use crate::domain::types::{bps_of, now_secs, AssetId, ProtocolId, UserId};
use crate::ports::access::{require_role, AccessControl, AccessError, Role};
use crate::ports::oracle::{OracleError, PriceOracle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown asset {0}")]
    UnknownAsset(AssetId),

    #[error("engine is in emergency mode")]
    EmergencyMode,

    #[error("stale market data: {age_secs}s old, window {window_secs}s")]
    StaleData { age_secs: u64, window_secs: u64 },

    #[error("execution cost {cost} above ceiling {ceiling}")]
    CostCeilingExceeded { cost: u64, ceiling: u64 },

    #[error("no suitable protocol for {asset}")]
    NoSuitableProtocol { asset: AssetId },

    #[error("flow {flow_id} passed its deadline")]
    DeadlineExceeded { flow_id: u64 },

    #[error("flow {0} not found")]
    FlowNotFound(u64),

    #[error("partial execution failure in flow {flow_id}: {detail}")]
    PartialExecutionFailure { flow_id: u64, detail: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl EngineError {
    /// Transient causes may be retried by re-triggering; everything else
    /// needs manual remediation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::StaleData { .. } | EngineError::CostCeilingExceeded { .. }
        )
    }
}

/// Time source used for flow deadlines and freshness checks
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Concrete decision produced by the optimize step
#[derive(Debug, Clone)]
enum RebalanceDecision {
    /// Move capital from a lower-yield venue to a higher-yield one
    Move {
        from: ProtocolId,
        to: ProtocolId,
        amount: u64,
        yield_delta_bps: u32,
    },
    /// Deploy idle capital across ranked venues
    AllocateIdle { legs: Vec<AllocationLeg> },
}

struct ActiveFlow {
    asset_id: AssetId,
    cancelled: Arc<AtomicBool>,
}

/// Staged rebalance orchestrator.
pub struct RebalanceEngine {
    ledger: Arc<RwLock<AssetLedger>>,
    registry: Arc<RwLock<ProtocolRegistry>>,
    oracle: Arc<dyn PriceOracle>,
    access: Arc<dyn AccessControl>,
    config: ConfigHandle,
    archive: FlowArchive,
    asset_locks: Mutex<HashMap<AssetId, Arc<Mutex<()>>>>,
    active: RwLock<HashMap<u64, ActiveFlow>>,
    next_flow_id: AtomicU64,
    emergency: AtomicBool,
    clock: Clock,
    /// Attribution id stamped on engine-initiated ledger mutations
    engine_id: UserId,
}

impl RebalanceEngine {
    pub fn new(
        ledger: Arc<RwLock<AssetLedger>>,
        registry: Arc<RwLock<ProtocolRegistry>>,
        oracle: Arc<dyn PriceOracle>,
        access: Arc<dyn AccessControl>,
        config: ConfigHandle,
        archive: FlowArchive,
    ) -> Self {
        Self {
            ledger,
            registry,
            oracle,
            access,
            config,
            archive,
            asset_locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            next_flow_id: AtomicU64::new(1),
            emergency: AtomicBool::new(false),
            clock: Arc::new(now_secs),
            engine_id: UserId::from("rebalance-engine"),
        }
    }

    /// Swap the wall-clock time source, e.g. for deterministic deadline
    /// handling in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Suspend or resume all triggering. Admin only.
    pub fn set_emergency(&self, caller: &UserId, on: bool) -> Result<(), EngineError> {
        require_role(self.access.as_ref(), caller, Role::Admin)?;
        self.emergency.store(on, Ordering::SeqCst);
        tracing::warn!("Emergency mode {}", if on { "ENABLED" } else { "disabled" });
        Ok(())
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Trigger gating: auto-rebalance on, no emergency, enough time elapsed,
    /// cost under ceiling, and detected divergence (idle capital at
    /// threshold or a qualifying yield delta). All must hold; a false is
    /// "not due", never an error.
    pub async fn should_rebalance(
        &self,
        asset: &AssetId,
        execution_cost: u64,
    ) -> Result<bool, EngineError> {
        if self.is_emergency() {
            return Ok(false);
        }
        let cfg = self.config.current();
        let now = self.now();

        let ledger = self.ledger.read().await;
        let registry = self.registry.read().await;
        let state = ledger
            .asset(asset)
            .ok_or_else(|| EngineError::UnknownAsset(asset.clone()))?;

        if !state.auto_rebalance_enabled {
            return Ok(false);
        }
        if now.saturating_sub(state.last_rebalance_time) < cfg.rebalance.time_threshold_secs {
            return Ok(false);
        }
        if execution_cost > cfg.rebalance.max_execution_cost {
            return Ok(false);
        }

        let idle_due = state.idle_threshold > 0
            && state.available() >= state.idle_threshold
            && !allocator::plan_allocation_best_effort(&registry, state.available()).is_empty();
        let yield_due = !allocator::find_rebalance_opportunities(
            &ledger,
            &registry,
            asset,
            cfg.rebalance.min_yield_delta_bps,
            cfg.rebalance.move_fraction_bps,
        )
        .is_empty();

        Ok(idle_due || yield_due)
    }

    /// Run one complete flow for an asset. The per-asset advisory lock is
    /// held from the Pending->Analyzing transition until termination.
    ///
    /// Cancellation surfaces as an `Ok` outcome with `Cancelled` status;
    /// step failures mark the flow `Failed`, archive it and return the
    /// error. Ledger mutations committed by completed steps are retained.
    pub async fn run_flow(
        &self,
        asset: &AssetId,
        execution_cost: u64,
    ) -> Result<FlowOutcome, EngineError> {
        if self.is_emergency() {
            return Err(EngineError::EmergencyMode);
        }
        let cfg = self.config.current();
        let now = self.now();
        let flow_id = self.next_flow_id.fetch_add(1, Ordering::SeqCst);
        let deadline = now + cfg.rebalance.flow_deadline_secs;
        let mut flow = RebalanceFlow::new(flow_id, asset.clone(), execution_cost, now, deadline);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.write().await.insert(
            flow_id,
            ActiveFlow {
                asset_id: asset.clone(),
                cancelled: cancelled.clone(),
            },
        );

        let lock = self.asset_lock(asset).await;
        let _guard = lock.lock().await;
        tracing::info!("Flow {} started for {}", flow_id, asset);

        let result = self
            .drive_flow(&mut flow, &cancelled, execution_cost, &cfg.rebalance)
            .await;

        let outcome = match result {
            Ok(moved_amount) => {
                tracing::info!(
                    "Flow {} succeeded for {} (moved {})",
                    flow_id,
                    asset,
                    moved_amount
                );
                Ok(FlowOutcome {
                    flow_id,
                    asset_id: asset.clone(),
                    status: flow.status,
                    moved_amount,
                    needs_review: flow.needs_review,
                })
            }
            Err(FlowAbort::Cancelled) => {
                tracing::warn!("Flow {} cancelled for {}", flow_id, asset);
                Ok(FlowOutcome {
                    flow_id,
                    asset_id: asset.clone(),
                    status: FlowStatus::Cancelled,
                    moved_amount: 0,
                    needs_review: false,
                })
            }
            Err(FlowAbort::Failed(err)) => {
                flow.fail(err.to_string(), self.now());
                tracing::error!("Flow {} failed for {}: {}", flow_id, asset, err);
                Err(err)
            }
        };

        if let Err(err) = self.archive.archive(&flow) {
            tracing::warn!("Could not archive flow {}: {}", flow_id, err);
        }
        self.active.write().await.remove(&flow_id);
        outcome
    }

    /// Run up to `max_batch` flows; one flow's failure never aborts its
    /// siblings. Assets that are "not due" are skipped without a result.
    pub async fn execute_batch(
        &self,
        assets: &[AssetId],
        execution_cost: u64,
    ) -> Vec<Result<FlowOutcome, EngineError>> {
        let max_batch = self.config.current().rebalance.max_batch;
        let mut results = Vec::new();

        for asset in assets {
            if results.len() >= max_batch {
                tracing::debug!("Batch limit {} reached", max_batch);
                break;
            }
            match self.should_rebalance(asset, execution_cost).await {
                Ok(false) => {
                    tracing::debug!("Asset {} not due for rebalance", asset);
                    continue;
                }
                Err(err) => {
                    results.push(Err(err));
                    continue;
                }
                Ok(true) => {}
            }
            results.push(self.run_flow(asset, execution_cost).await);
        }
        results
    }

    /// Request cancellation of an in-flight flow. Takes effect before the
    /// next step starts.
    pub async fn cancel(&self, flow_id: u64) -> Result<(), EngineError> {
        let active = self.active.read().await;
        let entry = active
            .get(&flow_id)
            .ok_or(EngineError::FlowNotFound(flow_id))?;
        entry.cancelled.store(true, Ordering::SeqCst);
        tracing::info!("Cancellation requested for flow {} ({})", flow_id, entry.asset_id);
        Ok(())
    }

    /// Archived history for an asset, oldest first.
    pub fn flow_history(
        &self,
        asset: &AssetId,
    ) -> Result<Vec<crate::application::archive::ArchivedFlow>, EngineError> {
        Ok(self.archive.load(asset)?)
    }

    async fn drive_flow(
        &self,
        flow: &mut RebalanceFlow,
        cancelled: &AtomicBool,
        execution_cost: u64,
        policy: &crate::config::RebalanceSection,
    ) -> Result<u64, FlowAbort> {
        let asset = flow.asset_id.clone();

        // Analyze
        self.checkpoint(flow, cancelled, FlowStatus::Analyzing)?;
        self.analyze(&asset, execution_cost, policy)
            .await
            .map_err(FlowAbort::Failed)?;
        flow.record_step(StepKind::Analyze, "data fresh, cost under ceiling", self.now());

        // Optimize
        self.checkpoint(flow, cancelled, FlowStatus::Optimizing)?;
        let decision = self
            .optimize(&asset, policy)
            .await
            .map_err(FlowAbort::Failed)?;
        flow.record_step(StepKind::Optimize, describe_decision(&decision), self.now());

        // Execute
        self.checkpoint(flow, cancelled, FlowStatus::Executing)?;
        if flow.past_deadline(self.now()) {
            return Err(FlowAbort::Failed(EngineError::DeadlineExceeded {
                flow_id: flow.flow_id,
            }));
        }
        let moved = self
            .execute(flow.flow_id, &asset, &decision)
            .await
            .map_err(FlowAbort::Failed)?;
        flow.record_step(StepKind::Execute, format!("moved {moved}"), self.now());

        // Verify
        self.checkpoint(flow, cancelled, FlowStatus::Verifying)?;
        let needs_review = self
            .verify(flow.flow_id, &asset, &decision, moved, execution_cost)
            .await
            .map_err(FlowAbort::Failed)?;
        flow.needs_review = needs_review;
        flow.record_step(
            StepKind::Verify,
            if needs_review {
                "post-conditions hold; flagged for review"
            } else {
                "post-conditions hold"
            },
            self.now(),
        );

        flow.advance(FlowStatus::Succeeded, self.now())
            .map_err(|e| FlowAbort::Failed(e.into()))?;
        Ok(moved)
    }

    /// Advance the flow, honoring a pending cancellation first.
    fn checkpoint(
        &self,
        flow: &mut RebalanceFlow,
        cancelled: &AtomicBool,
        next: FlowStatus,
    ) -> Result<(), FlowAbort> {
        if cancelled.load(Ordering::SeqCst) {
            let _ = flow.cancel(self.now());
            return Err(FlowAbort::Cancelled);
        }
        flow.advance(next, self.now())
            .map_err(|e| FlowAbort::Failed(e.into()))
    }

    /// Freshness and cost gate. Both oracle data and registry APY quotes
    /// must be inside the staleness window.
    async fn analyze(
        &self,
        asset: &AssetId,
        execution_cost: u64,
        policy: &crate::config::RebalanceSection,
    ) -> Result<(), EngineError> {
        if execution_cost > policy.max_execution_cost {
            return Err(EngineError::CostCeilingExceeded {
                cost: execution_cost,
                ceiling: policy.max_execution_cost,
            });
        }

        let now = self.now();
        let snapshot = self.oracle.get_pool_snapshot(asset).await?;
        let age = snapshot.age_secs(now);
        if age > policy.staleness_window_secs {
            return Err(EngineError::StaleData {
                age_secs: age,
                window_secs: policy.staleness_window_secs,
            });
        }

        let registry = self.registry.read().await;
        for info in registry.rank_by_yield(false) {
            let quote_age = now.saturating_sub(info.last_update);
            if quote_age > policy.staleness_window_secs {
                return Err(EngineError::StaleData {
                    age_secs: quote_age,
                    window_secs: policy.staleness_window_secs,
                });
            }
        }
        Ok(())
    }

    /// Pick a concrete decision from current snapshots. Capacity is taken
    /// from live state, so a plan formed here is re-checked by the ledger
    /// mutations during execute.
    async fn optimize(
        &self,
        asset: &AssetId,
        policy: &crate::config::RebalanceSection,
    ) -> Result<RebalanceDecision, EngineError> {
        let ledger = self.ledger.read().await;
        let registry = self.registry.read().await;

        let opportunities = allocator::find_rebalance_opportunities(
            &ledger,
            &registry,
            asset,
            policy.min_yield_delta_bps,
            policy.move_fraction_bps,
        );
        if let Some(best) = opportunities.first() {
            return Ok(RebalanceDecision::Move {
                from: best.from.clone(),
                to: best.to.clone(),
                amount: best.amount,
                yield_delta_bps: best.yield_delta_bps,
            });
        }

        let state = ledger
            .asset(asset)
            .ok_or_else(|| EngineError::UnknownAsset(asset.clone()))?;
        let idle = state.available();
        if idle >= state.idle_threshold && idle > 0 {
            let legs = allocator::plan_allocation_best_effort(&registry, idle);
            if !legs.is_empty() {
                return Ok(RebalanceDecision::AllocateIdle { legs });
            }
        }

        Err(EngineError::NoSuitableProtocol {
            asset: asset.clone(),
        })
    }

    /// Apply the decision as one logical unit. A move is deallocate then
    /// allocate; when the second leg fails the first is compensated so the
    /// ledger never ends half-moved.
    async fn execute(
        &self,
        flow_id: u64,
        asset: &AssetId,
        decision: &RebalanceDecision,
    ) -> Result<u64, EngineError> {
        let mut ledger = self.ledger.write().await;
        let mut registry = self.registry.write().await;
        let now = self.now();

        let moved = match decision {
            RebalanceDecision::Move {
                from, to, amount, ..
            } => {
                // Re-validate capacity; registry may have changed since
                // optimize released its read lock.
                let remaining = registry.remaining_capacity(to).map_err(LedgerError::from)?;
                let amount = (*amount).min(remaining);
                if amount == 0 {
                    return Err(EngineError::NoSuitableProtocol {
                        asset: asset.clone(),
                    });
                }

                ledger.return_virtual(&mut registry, from, asset, amount)?;
                if let Err(err) =
                    ledger.access_virtual(&mut registry, to, asset, amount, &self.engine_id)
                {
                    // Compensate the completed leg; the freed capacity at
                    // `from` makes this succeed barring registry removal.
                    ledger
                        .access_virtual(&mut registry, from, asset, amount, &self.engine_id)
                        .map_err(|comp_err| EngineError::PartialExecutionFailure {
                            flow_id,
                            detail: format!(
                                "allocate to {to} failed ({err}); compensation to {from} also failed ({comp_err})"
                            ),
                        })?;
                    tracing::warn!(
                        "Flow {}: move leg to {} failed, compensated back to {}",
                        flow_id,
                        to,
                        from
                    );
                    return Err(err.into());
                }
                tracing::info!("Flow {}: moved {} {} from {} to {}", flow_id, amount, asset, from, to);
                amount
            }
            RebalanceDecision::AllocateIdle { legs } => {
                let mut applied: Vec<&AllocationLeg> = Vec::new();
                let mut failure: Option<LedgerError> = None;
                for leg in legs {
                    match ledger.access_virtual(
                        &mut registry,
                        &leg.protocol,
                        asset,
                        leg.amount,
                        &self.engine_id,
                    ) {
                        Ok(()) => applied.push(leg),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                if let Some(err) = failure {
                    for leg in applied.iter().rev() {
                        ledger
                            .return_virtual(&mut registry, &leg.protocol, asset, leg.amount)
                            .map_err(|comp_err| EngineError::PartialExecutionFailure {
                                flow_id,
                                detail: format!(
                                    "idle deploy failed ({err}); unwind of {} also failed ({comp_err})",
                                    leg.protocol
                                ),
                            })?;
                    }
                    return Err(err.into());
                }
                let total: u64 = legs.iter().map(|l| l.amount).sum();
                tracing::info!("Flow {}: deployed {} idle {}", flow_id, total, asset);
                total
            }
        };

        ledger.mark_rebalanced(asset, now)?;
        Ok(moved)
    }

    /// Post-conditions: ledger identity and capacity bounds must hold. An
    /// uneconomic move (expected yield not above cost) is flagged for
    /// review, not failed.
    async fn verify(
        &self,
        flow_id: u64,
        asset: &AssetId,
        decision: &RebalanceDecision,
        moved: u64,
        execution_cost: u64,
    ) -> Result<bool, EngineError> {
        let ledger = self.ledger.read().await;
        let registry = self.registry.read().await;

        if !ledger.verify_identity(asset) {
            return Err(EngineError::PartialExecutionFailure {
                flow_id,
                detail: format!("ledger identity broken for {asset}"),
            });
        }
        for (protocol, _) in ledger.allocations_for(asset) {
            if let Some(info) = registry.get(&protocol) {
                if info.total_allocated > info.max_capacity {
                    return Err(EngineError::PartialExecutionFailure {
                        flow_id,
                        detail: format!("{protocol} allocated past capacity"),
                    });
                }
            }
        }

        let expected_yield = match decision {
            RebalanceDecision::Move {
                yield_delta_bps, ..
            } => bps_of(moved, *yield_delta_bps),
            RebalanceDecision::AllocateIdle { legs } => legs
                .iter()
                .map(|leg| {
                    registry
                        .get(&leg.protocol)
                        .map(|info| bps_of(leg.amount, info.current_apy_bps))
                        .unwrap_or(0)
                })
                .sum(),
        };
        let needs_review = expected_yield <= execution_cost;
        if needs_review {
            tracing::warn!(
                "Flow {}: expected yield {} does not clear cost {}, flagging for review",
                flow_id,
                expected_yield,
                execution_cost
            );
        }
        Ok(needs_review)
    }

    async fn asset_lock(&self, asset: &AssetId) -> Arc<Mutex<()>> {
        self.asset_locks
            .lock()
            .await
            .entry(asset.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Internal control flow for a running flow
enum FlowAbort {
    Cancelled,
    Failed(EngineError),
}

fn describe_decision(decision: &RebalanceDecision) -> String {
    match decision {
        RebalanceDecision::Move {
            from,
            to,
            amount,
            yield_delta_bps,
        } => format!("move {amount} from {from} to {to} (+{yield_delta_bps} bps)"),
        RebalanceDecision::AllocateIdle { legs } => {
            let total: u64 = legs.iter().map(|l| l.amount).sum();
            format!("deploy {total} idle across {} venues", legs.len())
        }
    }
}
