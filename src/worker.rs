// =============================================================================
// Market Workers — snapshot → candidate → decision → execution pipeline
// =============================================================================
//
// One worker per watched market. Each iteration renews the market lock,
// produces a candidate when the book has changed, runs the budgeted AI
// path, sizes through the risk manager, evaluates the decision engine, and
// hands any trade to the execution engine. The barrier is checked between
// every stage; a renewal failure drops the candidate unless a
// PENDING_UNKNOWN exists in the market, in which case the engine halts.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::budget::{BudgetManager, ReserveOutcome};
use crate::decision::{self, AiInput, DecisionOutcome};
use crate::event_store::EventStore;
use crate::execution::ExecutionEngine;
use crate::locks::{LockHandle, LockManager, LOCK_RENEW_INTERVAL_MS};
use crate::risk::{self, RiskManager, SizingInputs};
use crate::snapshot::{ws_healthy_decision, Snapshot, SnapshotStore};
use crate::state_machine::StateMachine;
use crate::types::{Candidate, CandidateStatus, HaltReason, ReasonCode};

/// Worker loop cadence.
const WORKER_TICK_MS: u64 = 2_000;

// ---------------------------------------------------------------------------
// Injected collaborators
// ---------------------------------------------------------------------------

/// Market metadata from the registry synchroniser (out of tree).
pub trait MarketRegistry: Send + Sync {
    fn eligible(&self, market_id: &str) -> bool;
    fn fee_rate(&self, market_id: &str) -> f64;
    fn days_to_resolution(&self, market_id: &str, now_ms: i64) -> f64;
}

/// AI analysis fan-out (out of tree). The budget manager wraps every call.
#[async_trait]
pub trait AiAdvisor: Send + Sync {
    /// Model key used for worst-case pricing.
    fn model_key(&self) -> &str;

    /// Analyze a candidate. Returns the calibrated input and the actual
    /// cost in cents.
    async fn analyze(&self, market_id: &str, snap: &Snapshot) -> Result<(AiInput, i64)>;
}

/// Advisor used when no AI path is configured: candidates trade on market
/// prices alone.
pub struct NoAdvisor;

#[async_trait]
impl AiAdvisor for NoAdvisor {
    fn model_key(&self) -> &str {
        "none"
    }

    async fn analyze(&self, _market_id: &str, _snap: &Snapshot) -> Result<(AiInput, i64)> {
        anyhow::bail!("no AI advisor configured")
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything a market worker needs, shared across workers.
pub struct WorkerDeps {
    pub app: Arc<AppState>,
    pub store: EventStore,
    pub snapshots: Arc<SnapshotStore>,
    pub locks: Arc<LockManager>,
    pub risk: Arc<RiskManager>,
    pub budget: Arc<BudgetManager>,
    pub execution: Arc<ExecutionEngine>,
    pub state_machine: Arc<StateMachine>,
    pub registry: Arc<dyn MarketRegistry>,
    pub advisor: Arc<dyn AiAdvisor>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run the worker loop for one market until the process shuts down.
pub async fn run_market_worker(deps: Arc<WorkerDeps>, market_id: String) {
    let worker_name = format!("worker-{market_id}");
    info!(market = %market_id, "market worker started");

    let mut lock: Option<LockHandle> = None;
    let mut last_renew_ms: i64 = 0;
    let mut last_evaluated_hash = String::new();

    loop {
        tokio::time::sleep(std::time::Duration::from_millis(WORKER_TICK_MS)).await;
        let now = now_ms();

        // Lock upkeep first: hold the market lease whenever possible.
        match upkeep_lock(&deps, &market_id, &worker_name, &mut lock, &mut last_renew_ms, now)
        {
            LockState::Held => {}
            LockState::Unavailable => continue,
            LockState::Halt => return,
        }

        // Barrier: no candidate production while halted.
        if deps.app.barrier_active() {
            continue;
        }

        // Durable state: only produce work when trading is possible.
        let state = match deps.state_machine.current(now) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "state read failed in worker");
                continue;
            }
        };
        if !state.state.allows_trading() {
            continue;
        }
        let paper = state.state == crate::types::TradingState::PaperTrading;

        if let Err(e) = run_pipeline_once(
            &deps,
            &market_id,
            &mut last_evaluated_hash,
            lock.as_ref().expect("lock held"),
            paper,
        )
        .await
        {
            warn!(market = %market_id, error = %e, "pipeline iteration failed");
        }
    }
}

enum LockState {
    Held,
    Unavailable,
    Halt,
}

fn upkeep_lock(
    deps: &WorkerDeps,
    market_id: &str,
    worker_name: &str,
    lock: &mut Option<LockHandle>,
    last_renew_ms: &mut i64,
    now: i64,
) -> LockState {
    match lock.as_ref() {
        None => match deps.locks.acquire(market_id, worker_name, now) {
            Ok(Some(handle)) => {
                *lock = Some(handle);
                *last_renew_ms = now;
                LockState::Held
            }
            Ok(None) => LockState::Unavailable,
            Err(e) => {
                warn!(market = market_id, error = %e, "lock acquire failed");
                LockState::Unavailable
            }
        },
        Some(handle) => {
            if now - *last_renew_ms < LOCK_RENEW_INTERVAL_MS {
                return LockState::Held;
            }
            match deps.locks.renew(handle, worker_name, now) {
                Ok(Some(renewed)) => {
                    *lock = Some(renewed);
                    *last_renew_ms = now;
                    LockState::Held
                }
                Ok(None) | Err(_) => {
                    // Renewal failed: with a PENDING_UNKNOWN in this market
                    // the engine must halt; otherwise drop the candidate
                    // and retry acquisition later.
                    *lock = None;
                    let pending = deps
                        .store
                        .pending_unknown_in_market(market_id)
                        .unwrap_or(true);
                    if pending {
                        warn!(
                            market = market_id,
                            "lock renewal failed with PENDING_UNKNOWN present — halting"
                        );
                        deps.app.raise_barrier();
                        let _ = deps
                            .state_machine
                            .halt(HaltReason::LockRenewFailedDuringPendingUnknown, now);
                        return LockState::Halt;
                    }
                    warn!(market = market_id, "lock renewal failed — candidate dropped");
                    LockState::Unavailable
                }
            }
        }
    }
}

/// One pass of candidate production, decision, and execution.
async fn run_pipeline_once(
    deps: &Arc<WorkerDeps>,
    market_id: &str,
    last_evaluated_hash: &mut String,
    lock: &LockHandle,
    paper: bool,
) -> Result<()> {
    let now = now_ms();
    let config = deps.app.runtime_config.read().clone();

    let Some(snap) = deps.snapshots.latest(market_id) else {
        return Ok(());
    };

    // Only evaluate fresh book content.
    if snap.content_hash == *last_evaluated_hash {
        return Ok(());
    }

    // Feed the risk mark buffer from every snapshot we look at.
    deps.risk.offer_sample(
        market_id,
        snap.yes.best_bid,
        snap.yes.best_ask,
        snap.yes.top_ask_depth_usd(),
        now,
    );

    if !deps.registry.eligible(market_id) {
        deps.app
            .record_no_trade(market_id, ReasonCode::MarketNotEligible, now);
        *last_evaluated_hash = snap.content_hash.clone();
        return Ok(());
    }

    // Decision-level WS health.
    if !ws_healthy_decision(
        market_id,
        &snap,
        deps.app.feed_status(),
        now,
        config.decision_freshness_ms,
    ) {
        deps.app
            .record_no_trade(market_id, ReasonCode::WsUnhealthyDecision, now);
        return Ok(());
    }

    let mut candidate = Candidate {
        id: Uuid::new_v4().to_string(),
        market_id: market_id.to_string(),
        snapshot_id: snap.id.clone(),
        snapshot_hash: snap.content_hash.clone(),
        created_at_ms: now,
        trigger_reasons: vec!["BOOK_CHANGED".to_string()],
        status: CandidateStatus::New,
        state_version: 0,
    };
    *last_evaluated_hash = snap.content_hash.clone();
    candidate.advance(CandidateStatus::Filtered);
    deps.store.upsert_candidate(&candidate)?;

    // ── AI path, budget-gated ───────────────────────────────────────────
    let ai = run_ai_path(deps, &mut candidate, &snap, now).await;

    // Barrier check between evidence and decision.
    if deps.app.barrier_active() {
        candidate.advance(CandidateStatus::Dropped);
        deps.store.upsert_candidate(&candidate)?;
        deps.app
            .record_no_trade(market_id, ReasonCode::BarrierActive, now);
        return Ok(());
    }

    // ── Sizing ──────────────────────────────────────────────────────────
    let Some(wallet) = deps.app.wallet_ref() else {
        deps.app
            .record_no_trade(market_id, ReasonCode::WalletRefStale, now);
        return Ok(());
    };
    if risk::wallet_ref_stale(wallet.updated_at_ms, now) {
        deps.app
            .record_no_trade(market_id, ReasonCode::WalletRefStale, now);
        return Ok(());
    }

    let active = deps.store.active_orders()?;
    let current_exposure: i64 = active.iter().map(|o| o.size_cents).sum();
    let open_positions = {
        let mut markets: Vec<&str> = active.iter().map(|o| o.market_id.as_str()).collect();
        markets.sort_unstable();
        markets.dedup();
        markets.len() as u32
    };

    let size_cents = match risk::size_position(
        &SizingInputs {
            wallet_cents: wallet.cents,
            current_exposure_cents: current_exposure,
            open_positions,
            venue_available_cents: wallet.cents - current_exposure,
        },
        &config,
    ) {
        Ok(size) => size,
        Err(reason) => {
            candidate.advance(CandidateStatus::Dropped);
            deps.store.upsert_candidate(&candidate)?;
            deps.app.record_no_trade(market_id, reason, now);
            return Ok(());
        }
    };

    // ── Decision ────────────────────────────────────────────────────────
    let outcome = decision::evaluate(
        &snap,
        ai.as_ref(),
        size_cents,
        deps.registry.fee_rate(market_id),
        paper,
        (WORKER_TICK_MS as f64) / 1_000.0,
        deps.registry.days_to_resolution(market_id, now),
        deps.app.manifest.client_order_id_max_len,
        deps.risk.realized_sigma(market_id, now),
        deps.app.manifest.taker_vol_sigma_max,
        &config,
        now,
    );

    let decision = match outcome {
        DecisionOutcome::NoTrade(reason) => {
            candidate.advance(CandidateStatus::Dropped);
            deps.store.upsert_candidate(&candidate)?;
            deps.app.record_no_trade(market_id, reason, now);
            debug!(market = market_id, reason = %reason, "no trade");
            return Ok(());
        }
        DecisionOutcome::Trade(decision) => decision,
    };
    candidate.advance(CandidateStatus::Decided);
    deps.store.upsert_candidate(&candidate)?;

    // Barrier check between decision and submit.
    if deps.app.barrier_active() {
        candidate.advance(CandidateStatus::Dropped);
        deps.store.upsert_candidate(&candidate)?;
        deps.app
            .record_no_trade(market_id, ReasonCode::BarrierActive, now);
        return Ok(());
    }

    // ── Execution ───────────────────────────────────────────────────────
    let result = deps
        .execution
        .execute(&candidate, &decision, &snap, lock)
        .await?;
    info!(market = market_id, result = %result, "execution result");

    match result {
        crate::execution::ExecutionResult::Submitted(_)
        | crate::execution::ExecutionResult::PaperResting(_) => {
            candidate.advance(CandidateStatus::Executed);
        }
        _ => candidate.advance(CandidateStatus::Dropped),
    }
    deps.store.upsert_candidate(&candidate)?;
    Ok(())
}

/// Reserve budget, run the advisor, settle. Any failure yields None and
/// the specific NO_TRADE reason is recorded; the candidate may still be
/// decided on market prices alone.
async fn run_ai_path(
    deps: &Arc<WorkerDeps>,
    candidate: &mut Candidate,
    snap: &Snapshot,
    now: i64,
) -> Option<AiInput> {
    candidate.advance(CandidateStatus::EvidenceDone);

    let model_key = deps.advisor.model_key();
    if model_key == "none" {
        return None;
    }

    let worst_case = deps
        .app
        .manifest
        .model_worst_case_cents
        .get(model_key)
        .copied()
        .unwrap_or(0);
    if worst_case <= 0 {
        return None;
    }

    let Some(wallet) = deps.app.wallet_ref() else {
        return None;
    };
    let caps = crate::budget::caps_for_wallet(wallet.cents);
    let correlation_id = candidate.id.clone();

    let reservation = match deps
        .budget
        .reserve(model_key, worst_case, &correlation_id, caps, now)
    {
        Ok(ReserveOutcome::Reserved(reservation)) => reservation,
        Ok(ReserveOutcome::Denied(limit)) => {
            deps.app
                .record_no_trade(&candidate.market_id, ReasonCode::AiBudgetDenied, now);
            debug!(market = %candidate.market_id, limit, "AI budget denied");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "budget reservation failed");
            return None;
        }
    };

    // Barrier between the reservation and the outbound call: nothing was
    // spent, so the reservation is released rather than settled.
    if deps.app.barrier_active() {
        if let Err(e) = deps.budget.release(&reservation.id) {
            warn!(error = %e, "budget release failed");
        }
        return None;
    }

    let analysis = deps.advisor.analyze(&candidate.market_id, snap).await;
    match analysis {
        Ok((ai, actual_cents)) => {
            if let Err(e) = deps.budget.settle(&reservation.id, Some(actual_cents)) {
                warn!(error = %e, "budget settle failed");
            }
            candidate.advance(CandidateStatus::AiDone);
            Some(ai)
        }
        Err(e) => {
            // Settle at the reserved worst case; the reaper would
            // otherwise force-settle it anyway.
            if let Err(settle_err) = deps.budget.settle(&reservation.id, None) {
                warn!(error = %settle_err, "budget settle after failure failed");
            }
            deps.app
                .record_no_trade(&candidate.market_id, ReasonCode::AiTimeout, now);
            warn!(error = %e, "AI analysis failed");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub struct StaticRegistry {
        pub fee: f64,
    }

    impl MarketRegistry for StaticRegistry {
        fn eligible(&self, _market_id: &str) -> bool {
            true
        }
        fn fee_rate(&self, _market_id: &str) -> f64 {
            self.fee
        }
        fn days_to_resolution(&self, _market_id: &str, _now_ms: i64) -> f64 {
            7.0
        }
    }

    #[tokio::test]
    async fn no_advisor_yields_no_ai_input() {
        let advisor = NoAdvisor;
        assert_eq!(advisor.model_key(), "none");
        assert!(advisor.analyze("mkt", &test_snap()).await.is_err());
    }

    fn test_snap() -> Snapshot {
        use crate::snapshot::{BookLevel, SideBook, SnapshotSource};
        let book = SideBook {
            best_bid: Some(0.42),
            best_ask: Some(0.44),
            bids: vec![BookLevel {
                price: 0.42,
                size_usd: 100.0,
            }],
            asks: vec![BookLevel {
                price: 0.44,
                size_usd: 100.0,
            }],
        };
        Snapshot::new(
            "s".into(),
            "mkt".into(),
            0,
            SnapshotSource::Ws,
            0,
            0,
            0,
            0,
            book.clone(),
            book,
        )
    }

    #[test]
    fn registry_defaults() {
        let registry = StaticRegistry { fee: 0.002 };
        assert!(registry.eligible("any"));
        assert!((registry.fee_rate("any") - 0.002).abs() < f64::EPSILON);
    }
}
