// =============================================================================
// Execution Engine — pre-exec gate, idempotent submit, PENDING_UNKNOWN
// =============================================================================
//
// Every submit flows: record the barrier generation, take the process-global
// SUBMIT_GATE, evaluate the full pre-exec gate, then — LIVE only — run the
// two-phase durability discipline (WAL intent, event intent, network, WAL
// result, event result). There are no submit retries anywhere: a given
// decision id produces at most one LIVE submit, and any ambiguous outcome
// enters PENDING_UNKNOWN where the reconciliation loop either resolves it
// or halts the engine.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertManager};
use crate::app_state::AppState;
use crate::decision::Decision;
use crate::event_store::EventStore;
use crate::locks::{LockHandle, LockManager};
use crate::paper::PaperEngine;
use crate::reconcile;
use crate::snapshot::{ws_healthy_exec, Snapshot, SnapshotStore};
use crate::state_machine::StateMachine;
use crate::types::{
    micros_to_price, price_to_micros, Blocker, Candidate, HaltReason, Order, OrderStatus,
    ReasonCode, TradingState,
};
use crate::venue::{SubmitRequest, VenueClient};
use crate::wal::{
    CancelIntentRecord, CancelResultRecord, OrderIntentRecord, OrderResultRecord, Wal,
    WalRecordKind,
};

/// Lock lease remaining required at the gate.
const LOCK_MIN_REMAINING_MS: i64 = 10_000;
/// PENDING_UNKNOWN reconciliation poll interval.
const PENDING_POLL_MS: u64 = 5_000;
/// PENDING_UNKNOWN iterations before ORPHAN_RISK (60 s at 5 s).
const PENDING_MAX_ITERS: u32 = 12;
/// FOUND acceptance tolerances.
const FOUND_SIZE_TOLERANCE: f64 = 0.01;
const FOUND_PRICE_TOLERANCE: f64 = 0.005;
/// Mid drift that discards the candidate during PENDING_UNKNOWN.
const PENDING_DRIFT_FRAC: f64 = 0.02;
/// Residual age that triggers cancellation.
const RESIDUAL_MAX_AGE_MS: i64 = 30_000;
/// The heartbeat sweep only touches PENDING_UNKNOWN orders at least this
/// old, so it never races a resolution loop that is still in flight.
pub const PENDING_SWEEP_MIN_AGE_MS: i64 = 90_000;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of an execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// LIVE order accepted by the venue.
    Submitted(Order),
    /// PAPER order resting in the simulator.
    PaperResting(Order),
    /// Venue definitively rejected the submit; no exposure exists.
    Rejected(Order),
    /// PENDING_UNKNOWN resolved as confirmed-absent; the market is cooling
    /// off and any retry needs a fresh candidate and snapshot.
    AbsentConfirmed(Order),
    /// Gate failure with the specific reason.
    Aborted(ReasonCode),
    /// An invariant forced a durable HALT.
    Halted(HaltReason),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted(o) => write!(f, "Submitted({})", o.client_order_id),
            Self::PaperResting(o) => write!(f, "PaperResting({})", o.client_order_id),
            Self::Rejected(o) => write!(f, "Rejected({})", o.client_order_id),
            Self::AbsentConfirmed(o) => write!(f, "AbsentConfirmed({})", o.client_order_id),
            Self::Aborted(reason) => write!(f, "Aborted({reason})"),
            Self::Halted(reason) => write!(f, "Halted({reason})"),
        }
    }
}

/// Verdict of the pre-exec gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Proceed { paper: bool },
    Abort(ReasonCode),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    app: Arc<AppState>,
    store: EventStore,
    wal: Arc<Wal>,
    venue: Arc<dyn VenueClient>,
    state_machine: Arc<StateMachine>,
    locks: Arc<LockManager>,
    paper: Arc<PaperEngine>,
    snapshots: Arc<SnapshotStore>,
    /// The shared reconciliation engine; the pre-submit cycle and the
    /// heartbeat must account drift in one place.
    reconciler: Arc<reconcile::ReconcileEngine>,
    alerts: Arc<AlertManager>,
    pending_poll_ms: u64,
    pending_max_iters: u32,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: Arc<AppState>,
        store: EventStore,
        wal: Arc<Wal>,
        venue: Arc<dyn VenueClient>,
        state_machine: Arc<StateMachine>,
        locks: Arc<LockManager>,
        paper: Arc<PaperEngine>,
        snapshots: Arc<SnapshotStore>,
        reconciler: Arc<reconcile::ReconcileEngine>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            app,
            store,
            wal,
            venue,
            state_machine,
            locks,
            paper,
            snapshots,
            reconciler,
            alerts,
            pending_poll_ms: PENDING_POLL_MS,
            pending_max_iters: PENDING_MAX_ITERS,
        }
    }

    /// Shorten the PENDING_UNKNOWN loop (tests).
    #[cfg(test)]
    pub fn with_pending_policy(mut self, poll_ms: u64, max_iters: u32) -> Self {
        self.pending_poll_ms = poll_ms;
        self.pending_max_iters = max_iters;
        self
    }

    // -------------------------------------------------------------------------
    // Pre-exec gate
    // -------------------------------------------------------------------------

    /// Evaluate the full pre-exec gate. `submit_generation` was recorded
    /// when this submit began; a /halt in between changes the barrier
    /// generation and aborts it here.
    pub fn pre_exec_gate(
        &self,
        candidate: &Candidate,
        decision: &Decision,
        snap: &Snapshot,
        lock: &LockHandle,
        submit_generation: u64,
        now_ms: i64,
    ) -> Result<GateDecision> {
        let config = self.app.runtime_config.read().clone();

        // Durable state and blockers.
        let state = self.state_machine.current(now_ms)?;
        if !state.state.allows_trading() {
            return Ok(GateDecision::Abort(ReasonCode::StateNotTrading));
        }
        let paper = state.state == TradingState::PaperTrading;
        if paper {
            if self.app.paper_inhibited() {
                return Ok(GateDecision::Abort(ReasonCode::StateNotTrading));
            }
        } else if self.app.no_new_exposure() {
            return Ok(GateDecision::Abort(ReasonCode::StateNotTrading));
        }

        // Barrier and generation.
        if self.app.barrier_active() || submit_generation != self.app.barrier_generation() {
            return Ok(GateDecision::Abort(ReasonCode::BarrierActive));
        }

        // Candidate age.
        if candidate.age_ms(now_ms) > config.candidate_max_age_ms {
            return Ok(GateDecision::Abort(ReasonCode::CandidateExpired));
        }

        // Market cool-off after a confirmed-absent ambiguous submit.
        if self.app.market_in_cooloff(&candidate.market_id, now_ms) {
            return Ok(GateDecision::Abort(ReasonCode::MarketCooloff));
        }

        // WS health at the execution bound, on the current epoch.
        let feed = self.app.feed_status();
        if snap.ws_epoch != self.app.ws_epoch()
            || !ws_healthy_exec(
                &candidate.market_id,
                snap,
                feed,
                now_ms,
                config.exec_freshness_ms,
            )
        {
            return Ok(GateDecision::Abort(ReasonCode::WsUnhealthyExec));
        }

        // Decision-to-execution delay.
        if now_ms - decision.created_at_ms > config.decision_to_exec_max_ms {
            return Ok(GateDecision::Abort(ReasonCode::DecisionExecDelayExceeded));
        }

        // RECONCILE_GREEN.
        if !reconcile::reconcile_green(&self.store, &self.app, now_ms)? {
            return Ok(GateDecision::Abort(ReasonCode::ReconcileNotGreen));
        }

        // Lock: held, not expiring, and unchanged since the decision.
        if lock.expires_at_ms < now_ms + LOCK_MIN_REMAINING_MS {
            return Ok(GateDecision::Abort(ReasonCode::LockExpiringSoon));
        }
        match self.locks.current_version(&candidate.market_id)? {
            None => return Ok(GateDecision::Abort(ReasonCode::LockLost)),
            Some(version) if version != lock.lock_version => {
                return Ok(GateDecision::Abort(ReasonCode::LockVersionChanged));
            }
            Some(_) => {}
        }

        // Unconfirmed cancels bar replacements in this market.
        let unconfirmed_cancel = self
            .store
            .active_orders()?
            .iter()
            .any(|o| o.market_id == candidate.market_id && o.status == OrderStatus::CancelRequested);
        if unconfirmed_cancel {
            return Ok(GateDecision::Abort(ReasonCode::CancelUnconfirmed));
        }

        // Mismatches.
        if reconcile::active_l2_l3_count(&self.store)? > 0 {
            return Ok(GateDecision::Abort(ReasonCode::MismatchActive));
        }

        Ok(GateDecision::Proceed { paper })
    }

    // -------------------------------------------------------------------------
    // Execute
    // -------------------------------------------------------------------------

    /// Execute one decided candidate. Takes the SUBMIT_GATE so that at most
    /// one outbound submission is in flight process-wide.
    pub async fn execute(
        &self,
        candidate: &Candidate,
        decision: &Decision,
        snap: &Snapshot,
        lock: &LockHandle,
    ) -> Result<ExecutionResult> {
        let submit_generation = self.app.barrier_generation();
        let _gate = self.app.submit_gate.lock().await;
        let now = now_ms();

        let paper = match self.pre_exec_gate(candidate, decision, snap, lock, submit_generation, now)? {
            GateDecision::Abort(reason) => {
                self.app.record_no_trade(&candidate.market_id, reason, now);
                info!(market = %candidate.market_id, reason = %reason, "execution aborted at gate");
                return Ok(ExecutionResult::Aborted(reason));
            }
            GateDecision::Proceed { paper } => paper,
        };

        // The decision record is immutable; persist it before any order
        // can reference it.
        self.store.insert_decision(decision)?;

        if paper {
            return self.execute_paper(decision, now);
        }
        self.execute_live(decision, snap, lock, submit_generation, now).await
    }

    // -------------------------------------------------------------------------
    // Paper path
    // -------------------------------------------------------------------------

    /// Paper orders bypass the WAL entirely and rest in the simulator.
    fn execute_paper(&self, decision: &Decision, now_ms: i64) -> Result<ExecutionResult> {
        let order = Order {
            id: Uuid::new_v4().to_string(),
            decision_id: decision.id.clone(),
            market_id: decision.market_id.clone(),
            side: decision.side,
            status: OrderStatus::Open,
            client_order_id: decision.client_order_id.clone(),
            exchange_order_id: None,
            price_micros: price_to_micros(decision.price),
            size_cents: decision.size_cents,
            filled_cents: 0,
            residual_cents: decision.size_cents,
            pending_unknown_since_ms: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            paper: true,
        };
        self.store.upsert_order(&order)?;
        self.store.append_event(
            "PAPER_ORDER_PLACED",
            Some(&decision.id),
            &serde_json::json!({
                "order_id": order.id,
                "market": order.market_id,
                "side": order.side.as_str(),
                "price_micros": order.price_micros,
                "size_cents": order.size_cents,
            }),
            now_ms,
        )?;
        // Paper fee baseline: the venue's actual fee rate is not known per
        // market here; the simulator applies its floor and multiplier.
        self.paper.place(order.clone(), 0.0);
        info!(order_id = %order.id, market = %order.market_id, "paper order resting");
        Ok(ExecutionResult::PaperResting(order))
    }

    // -------------------------------------------------------------------------
    // Live path
    // -------------------------------------------------------------------------

    async fn execute_live(
        &self,
        decision: &Decision,
        snap: &Snapshot,
        lock: &LockHandle,
        submit_generation: u64,
        now: i64,
    ) -> Result<ExecutionResult> {
        // Idempotency barrier: one LIVE submit per decision id, ever. A
        // suppressed duplicate never reaches the venue, so it precedes the
        // pre-submit reconciliation.
        if self.store.live_submit_recorded(&decision.client_order_id)? {
            warn!(
                client_order_id = %decision.client_order_id,
                "duplicate LIVE submit suppressed"
            );
            return Ok(ExecutionResult::Aborted(ReasonCode::DuplicateClientOrderId));
        }

        // A fresh reconciliation cycle runs before every LIVE submit; drift
        // it surfaces aborts the submit here.
        let wallet = self.app.wallet_ref().map(|w| w.cents).unwrap_or(0);
        match self.reconciler.run_cycle(wallet, now).await {
            Ok(_) => self.app.note_reconcile_completed(now_ms()),
            Err(e) => {
                warn!(error = %e, "pre-submit reconciliation failed — aborting submit");
                return Ok(ExecutionResult::Aborted(ReasonCode::ReconcileNotGreen));
            }
        }
        if reconcile::active_l2_l3_count(&self.store)? > 0 {
            return Ok(ExecutionResult::Aborted(ReasonCode::MismatchActive));
        }

        let intent = OrderIntentRecord {
            client_order_id: decision.client_order_id.clone(),
            decision_id: decision.id.clone(),
            market_id: decision.market_id.clone(),
            side: decision.side,
            price_micros: price_to_micros(decision.price),
            size_cents: decision.size_cents,
        };

        // Phase 1: WAL intent, fsynced. Failure: no submit.
        if let Err(e) = self.wal.append(WalRecordKind::OrderIntent, &intent, now) {
            error!(error = %e, "WAL ORDER_INTENT write failed — submit withheld");
            self.app.set_blocker(Blocker::WalDegraded);
            return Ok(ExecutionResult::Aborted(ReasonCode::WalWriteFailed));
        }

        // Phase 2: event store intent. Failure: durably abort the intent
        // and stay out of the market until the store recovers.
        let intent_event = serde_json::to_value(&intent)?;
        if let Err(e) = self
            .store
            .append_event("ORDER_INTENT", Some(&decision.id), &intent_event, now)
        {
            error!(error = %e, "event store ORDER_INTENT write failed — aborting intent");
            let _ = self.wal.append(
                WalRecordKind::OrderIntentAborted,
                &serde_json::json!({ "client_order_id": intent.client_order_id }),
                now_ms(),
            );
            self.app.set_blocker(Blocker::DbDegraded);
            // Best-effort durable downgrade; the blocker alone already
            // forbids new exposure while the store is down.
            let _ = self.state_machine.downgrade_to_observe("DB_DEGRADED", now_ms());
            return Ok(ExecutionResult::Aborted(ReasonCode::EventStoreWriteFailed));
        }

        // Final atomic re-check: nothing may suspend between here and the
        // network call itself.
        if self.app.barrier_active() || self.app.barrier_generation() != submit_generation {
            let _ = self.wal.append(
                WalRecordKind::OrderIntentAborted,
                &serde_json::json!({ "client_order_id": intent.client_order_id }),
                now_ms(),
            );
            return Ok(ExecutionResult::Aborted(ReasonCode::BarrierActive));
        }
        if self.locks.current_version(&decision.market_id)? != Some(lock.lock_version) {
            let _ = self.wal.append(
                WalRecordKind::OrderIntentAborted,
                &serde_json::json!({ "client_order_id": intent.client_order_id }),
                now_ms(),
            );
            return Ok(ExecutionResult::Aborted(ReasonCode::LockVersionChanged));
        }

        // Limit-only, post-only by default; the taker variant is allowed
        // only when the decision carried the marketable flag.
        let request = SubmitRequest {
            market_id: decision.market_id.clone(),
            side: decision.side,
            price: decision.price,
            size_cents: decision.size_cents,
            client_order_id: decision.client_order_id.clone(),
            post_only: !decision.marketable_limit,
            marketable_limit: decision.marketable_limit,
        };

        let outcome = self.venue.submit_limit_order(&request).await;
        let resolved_at = now_ms();

        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            decision_id: decision.id.clone(),
            market_id: decision.market_id.clone(),
            side: decision.side,
            status: OrderStatus::PendingSubmit,
            client_order_id: decision.client_order_id.clone(),
            exchange_order_id: None,
            price_micros: price_to_micros(decision.price),
            size_cents: decision.size_cents,
            filled_cents: 0,
            residual_cents: decision.size_cents,
            pending_unknown_since_ms: None,
            created_at_ms: now,
            updated_at_ms: resolved_at,
            paper: false,
        };

        match outcome {
            crate::types::Outcome::Success(submitted) => {
                order.exchange_order_id = Some(submitted.exchange_order_id.clone());
                order.filled_cents = submitted.filled_cents.min(order.size_cents);
                order.residual_cents = order.size_cents - order.filled_cents;
                order.status = if order.residual_cents == 0 {
                    OrderStatus::Filled
                } else if order.filled_cents > 0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Open
                };

                self.record_order_result(&order, resolved_at);
                self.store.upsert_order(&order)?;
                info!(
                    client_order_id = %order.client_order_id,
                    status = %order.status,
                    "live order submitted"
                );
                Ok(ExecutionResult::Submitted(order))
            }
            crate::types::Outcome::AbsentConfirmed => {
                order.status = OrderStatus::Rejected;
                self.record_order_result(&order, resolved_at);
                self.store.upsert_order(&order)?;
                warn!(client_order_id = %order.client_order_id, "live submit rejected");
                Ok(ExecutionResult::Rejected(order))
            }
            crate::types::Outcome::Ambiguous(reason) => {
                warn!(
                    client_order_id = %order.client_order_id,
                    reason = %reason,
                    "ambiguous submit outcome — entering PENDING_UNKNOWN"
                );
                order.status = OrderStatus::PendingUnknown;
                order.pending_unknown_since_ms = Some(resolved_at);
                self.store.upsert_order(&order)?;
                self.store.append_event(
                    "ORDER_PENDING_UNKNOWN",
                    Some(&decision.id),
                    &serde_json::json!({
                        "client_order_id": order.client_order_id,
                        "reason": reason,
                    }),
                    resolved_at,
                )?;

                let start_mid = snap.book(decision.side).mid();
                self.resolve_pending_unknown(order, start_mid).await
            }
        }
    }

    fn record_order_result(&self, order: &Order, now_ms: i64) {
        let result = OrderResultRecord {
            client_order_id: order.client_order_id.clone(),
            status: order.status,
            exchange_order_id: order.exchange_order_id.clone(),
            filled_cents: order.filled_cents,
        };
        // WAL result failure leaves the outcome known but not durable:
        // degrade and let reconciliation re-derive it after restart.
        if let Err(e) = self.wal.append(WalRecordKind::OrderResult, &result, now_ms) {
            error!(error = %e, "WAL ORDER_RESULT write failed");
            self.app.set_blocker(Blocker::WalDegraded);
        }
        match serde_json::to_value(&result) {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .append_event("ORDER_RESULT", Some(&order.decision_id), &payload, now_ms)
                {
                    error!(error = %e, "event store ORDER_RESULT write failed");
                    self.app.set_blocker(Blocker::DbDegraded);
                    let _ = self
                        .state_machine
                        .downgrade_to_observe("DB_DEGRADED", now_ms);
                }
            }
            Err(e) => error!(error = %e, "ORDER_RESULT serialise failed"),
        }
    }

    // -------------------------------------------------------------------------
    // PENDING_UNKNOWN resolution
    // -------------------------------------------------------------------------

    /// The only retry loop in the core: poll the venue by client order id
    /// until FOUND, ABSENT_CONFIRMED, or the time budget expires (HALT).
    ///
    /// The order row carries everything the FOUND acceptance needs (side,
    /// size, price from the decision that produced it), so this loop also
    /// serves WAL-adopted orphans where no in-memory Decision exists.
    pub async fn resolve_pending_unknown(
        &self,
        mut order: Order,
        start_mid: Option<f64>,
    ) -> Result<ExecutionResult> {
        let mut drifted = false;

        for _ in 0..self.pending_max_iters {
            tokio::time::sleep(std::time::Duration::from_millis(self.pending_poll_ms)).await;
            let now = now_ms();

            // Price-drift guard: a fresh evaluation is required regardless
            // of how the order resolves.
            if !drifted {
                if let (Some(start), Some(current)) = (
                    start_mid,
                    self.snapshots
                        .latest(&order.market_id)
                        .and_then(|s| s.book(order.side).mid()),
                ) {
                    if start > 0.0 && ((current - start) / start).abs() > PENDING_DRIFT_FRAC {
                        drifted = true;
                        warn!(
                            market = %order.market_id,
                            "mid drifted > 2% during PENDING_UNKNOWN — candidate discarded"
                        );
                        let _ = self.store.append_event(
                            "PENDING_UNKNOWN_DRIFT",
                            Some(&order.decision_id),
                            &serde_json::json!({ "client_order_id": order.client_order_id }),
                            now,
                        );
                    }
                }
            }

            match self.venue.find_order(&order.client_order_id).await {
                Ok(Some(venue_order)) => {
                    // FOUND: accept only an exact-side, near-exact order.
                    let size_off = (venue_order.size_cents - order.size_cents).abs() as f64
                        / order.size_cents.max(1) as f64;
                    let local_price = micros_to_price(order.price_micros);
                    let price_off = if local_price > 0.0 {
                        ((venue_order.price - local_price) / local_price).abs()
                    } else {
                        f64::INFINITY
                    };

                    if venue_order.side != order.side
                        || size_off > FOUND_SIZE_TOLERANCE
                        || price_off > FOUND_PRICE_TOLERANCE
                    {
                        error!(
                            client_order_id = %order.client_order_id,
                            "venue order does not match the decision — HALT"
                        );
                        self.halt(HaltReason::PendingUnknownMismatch, now).await?;
                        return Ok(ExecutionResult::Halted(HaltReason::PendingUnknownMismatch));
                    }

                    order.exchange_order_id = Some(venue_order.exchange_order_id.clone());
                    order.filled_cents = venue_order.filled_cents.min(order.size_cents);
                    order.residual_cents = order.size_cents - order.filled_cents;
                    order.status = if order.residual_cents == 0 {
                        OrderStatus::Filled
                    } else if order.filled_cents > 0 {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Open
                    };
                    order.pending_unknown_since_ms = None;
                    order.updated_at_ms = now;

                    self.record_order_result(&order, now);
                    self.store.upsert_order(&order)?;
                    info!(
                        client_order_id = %order.client_order_id,
                        status = %order.status,
                        "PENDING_UNKNOWN resolved: FOUND"
                    );
                    return Ok(ExecutionResult::Submitted(order));
                }
                Ok(None) => {
                    // ABSENT_CONFIRMED: no exposure exists; bar the market.
                    order.status = OrderStatus::Cancelled;
                    order.pending_unknown_since_ms = None;
                    order.updated_at_ms = now;
                    self.record_order_result(&order, now);
                    self.store.upsert_order(&order)?;

                    let config = self.app.runtime_config.read().clone();
                    self.app
                        .set_market_cooloff(&order.market_id, now + config.market_cooloff_ms);
                    info!(
                        client_order_id = %order.client_order_id,
                        market = %order.market_id,
                        "PENDING_UNKNOWN resolved: ABSENT_CONFIRMED — market cooling off"
                    );
                    return Ok(ExecutionResult::AbsentConfirmed(order));
                }
                Err(e) => {
                    // Transient read failure: keep polling inside the budget.
                    warn!(error = %e, "PENDING_UNKNOWN lookup failed — retrying");
                }
            }
        }

        let now = now_ms();
        error!(
            client_order_id = %order.client_order_id,
            "PENDING_UNKNOWN inconclusive after time budget — HALT"
        );
        self.halt(HaltReason::OrphanRisk, now).await?;
        Ok(ExecutionResult::Halted(HaltReason::OrphanRisk))
    }

    /// Drive outstanding PENDING_UNKNOWN orders through the resolution
    /// loop. Startup uses this for WAL-adopted orphans (`min_age_ms = 0`);
    /// the heartbeat sweeps only stragglers older than the in-flight
    /// budget so it never races a live resolution. Stops early when a
    /// resolution halts the engine. Returns how many orders resolved.
    pub async fn resolve_outstanding_pending_unknown(&self, min_age_ms: i64) -> Result<usize> {
        let now = now_ms();
        let pending = self.store.pending_unknown_orders()?;
        let mut resolved = 0;

        for order in pending {
            let old_enough = order
                .pending_unknown_since_ms
                .map_or(true, |since| now - since >= min_age_ms);
            if !old_enough {
                continue;
            }

            match self.resolve_pending_unknown(order, None).await? {
                ExecutionResult::Halted(reason) => {
                    warn!(reason = %reason, "pending-unknown sweep halted the engine");
                    return Ok(resolved);
                }
                ExecutionResult::Submitted(_) | ExecutionResult::AbsentConfirmed(_) => {
                    resolved += 1;
                }
                _ => {}
            }
        }
        Ok(resolved)
    }

    // -------------------------------------------------------------------------
    // Residual management
    // -------------------------------------------------------------------------

    /// Cancel LIVE residuals older than 30 s. An ambiguous cancel becomes
    /// PENDING_UNKNOWN (cancel variant) and halts if unresolved within the
    /// budget. Returns how many cancels were issued so the caller can
    /// trigger a follow-up reconciliation.
    pub async fn cancel_stale_residuals(&self) -> Result<usize> {
        let now = now_ms();
        let stale: Vec<Order> = self
            .store
            .active_orders()?
            .into_iter()
            .filter(|o| {
                !o.paper
                    && matches!(o.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
                    && o.residual_cents > 0
                    && now - o.updated_at_ms > RESIDUAL_MAX_AGE_MS
            })
            .collect();

        let mut issued = 0usize;
        for mut order in stale {
            let Some(exchange_id) = order.exchange_order_id.clone() else {
                continue;
            };

            let cancel_intent = CancelIntentRecord {
                client_order_id: order.client_order_id.clone(),
                exchange_order_id: Some(exchange_id.clone()),
            };
            if let Err(e) = self
                .wal
                .append(WalRecordKind::CancelIntent, &cancel_intent, now)
            {
                error!(error = %e, "WAL CANCEL_INTENT write failed — cancel withheld");
                self.app.set_blocker(Blocker::WalDegraded);
                return Ok(issued);
            }

            order.status = OrderStatus::CancelRequested;
            order.updated_at_ms = now;
            self.store.upsert_order(&order)?;
            issued += 1;

            match self.venue.cancel_order(&order.market_id, &exchange_id).await {
                crate::types::Outcome::Success(())
                | crate::types::Outcome::AbsentConfirmed => {
                    order.status = OrderStatus::Cancelled;
                    order.residual_cents = 0;
                    order.updated_at_ms = now_ms();
                    let _ = self.wal.append(
                        WalRecordKind::CancelResult,
                        &CancelResultRecord {
                            client_order_id: order.client_order_id.clone(),
                            outcome: "CONFIRMED".to_string(),
                        },
                        order.updated_at_ms,
                    );
                    self.store.upsert_order(&order)?;
                    info!(client_order_id = %order.client_order_id, "stale residual cancelled");
                }
                crate::types::Outcome::Ambiguous(reason) => {
                    warn!(
                        client_order_id = %order.client_order_id,
                        reason = %reason,
                        "ambiguous cancel — PENDING_UNKNOWN (cancel variant)"
                    );
                    order.status = OrderStatus::PendingUnknown;
                    order.pending_unknown_since_ms = Some(now_ms());
                    self.store.upsert_order(&order)?;

                    if !self.resolve_pending_cancel(&mut order).await? {
                        self.halt(HaltReason::ResidualCancelUnknown, now_ms()).await?;
                        return Ok(issued);
                    }
                }
            }
        }
        Ok(issued)
    }

    /// Poll until the cancelled order is confirmed gone (or inactive at the
    /// venue). Returns false when the budget expires unresolved.
    async fn resolve_pending_cancel(&self, order: &mut Order) -> Result<bool> {
        for _ in 0..self.pending_max_iters {
            tokio::time::sleep(std::time::Duration::from_millis(self.pending_poll_ms)).await;
            let now = now_ms();

            match self.venue.find_order(&order.client_order_id).await {
                Ok(None) => {
                    order.status = OrderStatus::Cancelled;
                    order.residual_cents = 0;
                    order.pending_unknown_since_ms = None;
                    order.updated_at_ms = now;
                    let _ = self.wal.append(
                        WalRecordKind::CancelResult,
                        &CancelResultRecord {
                            client_order_id: order.client_order_id.clone(),
                            outcome: "ABSENT".to_string(),
                        },
                        now,
                    );
                    self.store.upsert_order(order)?;
                    return Ok(true);
                }
                Ok(Some(venue_order)) => {
                    if venue_order.status == "CANCELLED" {
                        order.status = OrderStatus::Cancelled;
                        order.residual_cents = 0;
                        order.pending_unknown_since_ms = None;
                        order.updated_at_ms = now;
                        let _ = self.wal.append(
                            WalRecordKind::CancelResult,
                            &CancelResultRecord {
                                client_order_id: order.client_order_id.clone(),
                                outcome: "CONFIRMED".to_string(),
                            },
                            now,
                        );
                        self.store.upsert_order(order)?;
                        return Ok(true);
                    }
                    // Still live at the venue: keep polling.
                }
                Err(e) => warn!(error = %e, "pending cancel lookup failed — retrying"),
            }
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Fills and orphans
    // -------------------------------------------------------------------------

    /// Apply a fill to a local order. A fill arriving while the order is
    /// CANCEL_REQUESTED moves it to PARTIALLY_FILLED with the residual
    /// recomputed.
    pub fn apply_fill(&self, order: &mut Order, fill_cents: i64, now_ms: i64) -> Result<()> {
        order.filled_cents = (order.filled_cents + fill_cents).min(order.size_cents);
        order.residual_cents = order.size_cents - order.filled_cents;
        order.status = if order.residual_cents == 0 {
            OrderStatus::Filled
        } else {
            // Includes the CANCEL_REQUESTED case.
            OrderStatus::PartiallyFilled
        };
        order.updated_at_ms = now_ms;
        self.store.upsert_order(order)?;
        Ok(())
    }

    /// Adopt a WAL-orphaned ORDER_INTENT as PENDING_UNKNOWN (startup step
    /// 8). The startup sweep then drives it through
    /// [`Self::resolve_pending_unknown`] before any worker starts.
    pub fn adopt_orphan(&self, intent: &OrderIntentRecord, now_ms: i64) -> Result<Order> {
        let order = Order {
            id: Uuid::new_v4().to_string(),
            decision_id: intent.decision_id.clone(),
            market_id: intent.market_id.clone(),
            side: intent.side,
            status: OrderStatus::PendingUnknown,
            client_order_id: intent.client_order_id.clone(),
            exchange_order_id: None,
            price_micros: intent.price_micros,
            size_cents: intent.size_cents,
            filled_cents: 0,
            residual_cents: intent.size_cents,
            pending_unknown_since_ms: Some(now_ms),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            paper: false,
        };
        self.store.upsert_order(&order)?;
        self.store.append_event(
            "ORPHAN_ADOPTED",
            Some(&intent.decision_id),
            &serde_json::json!({ "client_order_id": intent.client_order_id }),
            now_ms,
        )?;
        warn!(
            client_order_id = %intent.client_order_id,
            "orphaned ORDER_INTENT adopted as PENDING_UNKNOWN"
        );
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Halt
    // -------------------------------------------------------------------------

    async fn halt(&self, reason: HaltReason, now_ms: i64) -> Result<()> {
        self.app.raise_barrier();
        self.state_machine.halt(reason, now_ms)?;

        let kind = match reason {
            HaltReason::OrphanRisk => AlertKind::OrphanRisk,
            HaltReason::PendingUnknownMismatch => AlertKind::PendingUnknownMismatch,
            _ => AlertKind::Halted,
        };
        self.alerts.emit(
            kind,
            reason.as_str(),
            format!("engine halted: {reason}"),
            now_ms,
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Manifest, RuntimeConfig};
    use crate::snapshot::{BookLevel, SideBook, SnapshotSource};
    use crate::state_machine::{arming_file_sig, ArmingFilePolicy};
    use crate::totp::TotpValidator;
    use crate::types::Side;
    use crate::venue::testkit::ScriptedVenue;
    use crate::venue::{SubmittedOrder, VenueOrder};
    use std::collections::BTreeMap;

    struct Fixture {
        engine: ExecutionEngine,
        app: Arc<AppState>,
        store: EventStore,
        venue: Arc<ScriptedVenue>,
        sm: Arc<StateMachine>,
        locks: Arc<LockManager>,
        snapshots: Arc<SnapshotStore>,
        wal_path: std::path::PathBuf,
        arming_path: String,
        _dir: tempfile::TempDir,
    }

    fn manifest() -> Manifest {
        Manifest {
            artifacts: BTreeMap::new(),
            client_order_id_max_len: 16,
            venue_tick: 0.001,
            taker_vol_sigma_max: 0.004,
            model_worst_case_cents: BTreeMap::new(),
            operator_allowlist: vec![],
            sig: String::new(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with_venue(Arc::new(ScriptedVenue::new()))
    }

    fn fixture_with_venue(venue: Arc<ScriptedVenue>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        let wal = Arc::new(Wal::open(&wal_path).unwrap());
        let store = EventStore::open_in_memory().unwrap();
        let app = Arc::new(AppState::new(RuntimeConfig::default(), manifest()));
        let arming_path = dir.path().join("armed").to_string_lossy().into_owned();

        let sm = Arc::new(StateMachine::new(
            store.clone(),
            wal.clone(),
            b"state-secret".to_vec(),
            b"local-secret".to_vec(),
            TotpValidator::new(b"totp-secret".to_vec()),
            ArmingFilePolicy {
                path: arming_path.clone(),
                expected_uid: None,
                expected_gid: None,
                expected_mode: 0o640,
            },
        ));
        let locks = Arc::new(LockManager::new(store.clone(), "inst-test"));
        let paper = Arc::new(PaperEngine::new(0.001));
        let snapshots = Arc::new(SnapshotStore::new(None));

        let reconciler = Arc::new(reconcile::ReconcileEngine::new(
            store.clone(),
            venue.clone() as Arc<dyn VenueClient>,
        ));
        let engine = ExecutionEngine::new(
            app.clone(),
            store.clone(),
            wal,
            venue.clone() as Arc<dyn VenueClient>,
            sm.clone(),
            locks.clone(),
            paper,
            snapshots.clone(),
            reconciler,
            Arc::new(AlertManager::new(Arc::new(crate::alerts::TracingNotifier))),
        )
        .with_pending_policy(1, 3);

        Fixture {
            engine,
            app,
            store,
            venue,
            sm,
            locks,
            snapshots,
            wal_path,
            arming_path,
            _dir: dir,
        }
    }

    fn totp_code(now_ms: i64) -> String {
        TotpValidator::new(b"totp-secret".to_vec()).code_at(now_ms / 1_000)
    }

    /// Put the fixture into PAPER_TRADING.
    fn enter_paper(fix: &Fixture, now_ms: i64) {
        fix.sm.resume_paper(&totp_code(now_ms), now_ms).unwrap();
    }

    /// Run the full arming ceremony into LIVE_TRADING.
    fn enter_live(fix: &Fixture, base_ms: i64) {
        use std::os::unix::fs::PermissionsExt;
        let nonce1 = fix.sm.arm_live_init(base_ms).unwrap();
        let nonce2 = fix
            .sm
            .confirm_step1(&nonce1, &totp_code(base_ms + 1_000), base_ms + 1_000)
            .unwrap();

        let t = base_ms + 61_000;
        let process_start = fix.app.process_start_unix_ms;
        let sig = arming_file_sig(&nonce2, t / 1_000, process_start, b"local-secret");
        let body = serde_json::json!({
            "nonce2": nonce2,
            "ts_utc": t / 1_000,
            "process_start_unix_ms": process_start,
            "sig": sig,
        });
        std::fs::write(&fix.arming_path, body.to_string()).unwrap();
        std::fs::set_permissions(
            &fix.arming_path,
            std::fs::Permissions::from_mode(0o640),
        )
        .unwrap();
        fix.sm
            .confirm_step2(&nonce2, &totp_code(t), process_start, t)
            .unwrap();
    }

    fn healthy_snapshot(fix: &Fixture, now_ms: i64) -> Snapshot {
        let book = |bid: f64, ask: f64| SideBook {
            best_bid: Some(bid),
            best_ask: Some(ask),
            bids: vec![BookLevel {
                price: bid,
                size_usd: 500.0,
            }],
            asks: vec![BookLevel {
                price: ask,
                size_usd: 500.0,
            }],
        };
        Snapshot::new(
            "snap-1".into(),
            "mkt-1".into(),
            now_ms - 500,
            SnapshotSource::Ws,
            fix.app.ws_epoch(),
            now_ms - 200,
            now_ms - 500,
            now_ms - 500,
            book(0.42, 0.44),
            book(0.55, 0.57),
        )
    }

    fn candidate(now_ms: i64) -> Candidate {
        Candidate {
            id: "cand-1".into(),
            market_id: "mkt-1".into(),
            snapshot_id: "snap-1".into(),
            snapshot_hash: "h".into(),
            created_at_ms: now_ms - 1_000,
            trigger_reasons: vec!["PRICE_MOVE".into()],
            status: crate::types::CandidateStatus::Decided,
            state_version: 3,
        }
    }

    fn decision(now_ms: i64) -> Decision {
        Decision {
            id: "d".repeat(64),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            snapshot_hash: "h".into(),
            price: 0.43,
            size_cents: 2_000,
            p_market: 0.44,
            p_eff: 0.48,
            required_edge: 0.02,
            ev: 0.02,
            friction: crate::decision::Friction {
                spread_cost: 0.01,
                fee_cost: 0.002,
                slippage: 0.005,
                dispute: 0.01,
                latency: 0.0,
                time_value: 0.001,
            },
            marketable_limit: false,
            client_order_id: "d".repeat(16),
            created_at_ms: now_ms - 1_000,
        }
    }

    /// Make every gate condition pass at `now_ms` and return the inputs.
    fn green_setup(fix: &Fixture, now_ms: i64) -> (Candidate, Decision, Snapshot, LockHandle) {
        fix.app.ws_set_connected(true);
        fix.app.ws_note_message(now_ms - 200);
        fix.app.note_reconcile_completed(now_ms - 100);
        let lock = fix.locks.acquire("mkt-1", "w1", now_ms).unwrap().unwrap();
        (candidate(now_ms), decision(now_ms), healthy_snapshot(fix, now_ms), lock)
    }

    #[tokio::test]
    async fn gate_rejects_when_not_trading() {
        let fix = fixture();
        let now = now_ms();
        let (cand, dec, snap, lock) = green_setup(&fix, now);
        // State is OBSERVE_ONLY.
        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::StateNotTrading));
    }

    #[tokio::test]
    async fn gate_split_freshness_fails_exec_only() {
        let fix = fixture();
        let now = now_ms();
        enter_paper(&fix, now);
        let (cand, dec, mut snap, lock) = green_setup(&fix, now);

        // Market data 5 s old: inside the 6 s decision bound, outside the
        // 3 s execution bound.
        snap.market_last_ws_update_ms = now - 5_000;
        snap.orderbook_last_change_ms = now - 5_000;

        let feed = fix.app.feed_status();
        assert!(crate::snapshot::ws_healthy_decision(
            "mkt-1", &snap, feed, now, 6_000
        ));

        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::WsUnhealthyExec));

        // No order was ever persisted.
        assert!(fix.store.active_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gate_decision_delay_boundary() {
        let fix = fixture();
        let now = now_ms();
        enter_paper(&fix, now);
        let (cand, mut dec, snap, lock) = green_setup(&fix, now);

        // Exactly 8 s: passes.
        dec.created_at_ms = now - 8_000;
        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Proceed { paper: true });

        // 8.001 s: fails.
        dec.created_at_ms = now - 8_001;
        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(
            verdict,
            GateDecision::Abort(ReasonCode::DecisionExecDelayExceeded)
        );
    }

    #[tokio::test]
    async fn gate_enforces_barrier_generation() {
        let fix = fixture();
        let now = now_ms();
        enter_paper(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now);

        let stale_generation = fix.app.barrier_generation();
        fix.app.raise_barrier();
        fix.app.lower_barrier();

        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, stale_generation, now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::BarrierActive));
    }

    #[tokio::test]
    async fn gate_checks_lock_version_and_expiry() {
        let fix = fixture();
        let now = now_ms();
        enter_paper(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now);

        // Stale version.
        let stale = LockHandle {
            lock_version: lock.lock_version + 1,
            ..lock.clone()
        };
        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &stale, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::LockVersionChanged));

        // Expiring lease.
        let expiring = LockHandle {
            expires_at_ms: now + LOCK_MIN_REMAINING_MS - 1,
            ..lock
        };
        let verdict = fix
            .engine
            .pre_exec_gate(&cand, &dec, &snap, &expiring, fix.app.barrier_generation(), now)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::LockExpiringSoon));
    }

    #[tokio::test]
    async fn paper_execution_rests_in_simulator() {
        let fix = fixture();
        let now = now_ms();
        enter_paper(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now);

        let result = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        let ExecutionResult::PaperResting(order) = result else {
            panic!("expected paper resting, got {result}");
        };
        assert!(order.paper);
        assert_eq!(order.status, OrderStatus::Open);

        // Paper never touches the WAL (beyond state transitions) or the venue.
        let kinds: Vec<WalRecordKind> = Wal::read_all(&fix.wal_path)
            .unwrap()
            .iter()
            .map(|r| r.kind)
            .collect();
        assert!(kinds.iter().all(|k| *k == WalRecordKind::StateChanged));
        assert!(fix.venue.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn live_submit_writes_two_phase_wal() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Success(SubmittedOrder {
                exchange_order_id: "x-1".into(),
                status: "OPEN".into(),
                filled_cents: 0,
            }));

        let result = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        let ExecutionResult::Submitted(order) = result else {
            panic!("expected submitted, got {result}");
        };
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.exchange_order_id.as_deref(), Some("x-1"));

        // Intent before result, in WAL order.
        let records = Wal::read_all(&fix.wal_path).unwrap();
        let kinds: Vec<WalRecordKind> = records.iter().map(|r| r.kind).collect();
        let intent_pos = kinds
            .iter()
            .position(|k| *k == WalRecordKind::OrderIntent)
            .unwrap();
        let result_pos = kinds
            .iter()
            .position(|k| *k == WalRecordKind::OrderResult)
            .unwrap();
        assert!(intent_pos < result_pos);

        assert_eq!(fix.venue.submitted.lock().len(), 1);
        assert!(fix.venue.submitted.lock()[0].post_only);
    }

    #[tokio::test]
    async fn live_submit_is_idempotent_per_decision() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Success(SubmittedOrder {
                exchange_order_id: "x-1".into(),
                status: "OPEN".into(),
                filled_cents: 0,
            }));

        let first = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        assert!(matches!(first, ExecutionResult::Submitted(_)));

        // Same decision again: suppressed before any venue call. The gate
        // would also fail RECONCILE_GREEN (open order now exists), so call
        // the live path directly.
        let second = fix
            .engine
            .execute_live(&dec, &snap, &lock, fix.app.barrier_generation(), now_ms())
            .await
            .unwrap();
        assert!(matches!(
            second,
            ExecutionResult::Aborted(ReasonCode::DuplicateClientOrderId)
        ));
        assert_eq!(fix.venue.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn pending_unknown_found_matching_adopts_order() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Ambiguous("504".into()));
        fix.venue.add_lookup_order(VenueOrder {
            client_order_id: dec.client_order_id.clone(),
            exchange_order_id: "x-9".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            price: 0.43,
            size_cents: 2_000,
            filled_cents: 500,
            status: "OPEN".into(),
        });

        let result = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        let ExecutionResult::Submitted(order) = result else {
            panic!("expected adoption, got {result}");
        };
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_cents, 500);
        assert_eq!(order.residual_cents, 1_500);
    }

    #[tokio::test]
    async fn pending_unknown_mismatch_halts_without_cancel() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Ambiguous("504".into()));
        // Venue reports the SAME client id with the OPPOSITE side.
        fix.venue.add_lookup_order(VenueOrder {
            client_order_id: dec.client_order_id.clone(),
            exchange_order_id: "x-9".into(),
            market_id: "mkt-1".into(),
            side: Side::No,
            price: 0.43,
            size_cents: 2_000,
            filled_cents: 0,
            status: "OPEN".into(),
        });

        let result = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        assert!(matches!(
            result,
            ExecutionResult::Halted(HaltReason::PendingUnknownMismatch)
        ));

        // Durable state is HALTED and no CANCELLED status was written.
        assert_eq!(
            fix.sm.current(now_ms()).unwrap().state,
            TradingState::Halted
        );
        let order = fix
            .store
            .get_order_by_client_id(&dec.client_order_id)
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingUnknown);
    }

    #[tokio::test]
    async fn pending_unknown_absent_confirms_and_cools_market() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Ambiguous("timeout".into()));
        // Venue has no such order: ABSENT_CONFIRMED.

        let result = fix.engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        let ExecutionResult::AbsentConfirmed(order) = result else {
            panic!("expected absent-confirmed, got {result}");
        };
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(fix.app.market_in_cooloff("mkt-1", now_ms()));

        // A follow-up attempt aborts on the cool-off.
        let t2 = now_ms();
        let (cand2, dec2, snap2, lock2) = green_setup(&fix, t2);
        let verdict = fix
            .engine
            .pre_exec_gate(&cand2, &dec2, &snap2, &lock2, fix.app.barrier_generation(), t2)
            .unwrap();
        assert_eq!(verdict, GateDecision::Abort(ReasonCode::MarketCooloff));
    }

    #[tokio::test]
    async fn pending_unknown_inconclusive_halts_orphan_risk() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        fix.venue
            .push_submit_outcome(crate::types::Outcome::Ambiguous("504".into()));

        // A venue whose by-id lookup errors keeps the outcome unknowable:
        // the loop must exhaust its budget and halt, never guess ABSENT.
        struct BlindVenue;
        #[async_trait::async_trait]
        impl VenueClient for BlindVenue {
            async fn server_time_ms(&self) -> Result<i64> {
                Ok(0)
            }
            async fn balance_cents(&self) -> Result<i64> {
                Ok(0)
            }
            async fn open_orders(&self) -> Result<Vec<VenueOrder>> {
                Ok(vec![])
            }
            async fn fills_since(&self, _: i64) -> Result<Vec<crate::venue::VenueFill>> {
                Ok(vec![])
            }
            async fn positions(&self) -> Result<Vec<crate::venue::VenuePosition>> {
                Ok(vec![])
            }
            // The by-id lookup is the one read the resolution loop needs,
            // and it stays dark for the whole budget.
            async fn find_order(&self, _: &str) -> Result<Option<VenueOrder>> {
                anyhow::bail!("down")
            }
            async fn submit_limit_order(
                &self,
                _: &SubmitRequest,
            ) -> crate::types::Outcome<SubmittedOrder> {
                crate::types::Outcome::Ambiguous("down".into())
            }
            async fn cancel_order(&self, _: &str, _: &str) -> crate::types::Outcome<()> {
                crate::types::Outcome::Ambiguous("down".into())
            }
        }

        let blind_venue: Arc<dyn VenueClient> = Arc::new(BlindVenue);
        let blind_engine = ExecutionEngine::new(
            fix.app.clone(),
            fix.store.clone(),
            Arc::new(Wal::open(fix.wal_path.clone()).unwrap()),
            blind_venue.clone(),
            fix.sm.clone(),
            fix.locks.clone(),
            Arc::new(PaperEngine::new(0.001)),
            fix.snapshots.clone(),
            Arc::new(reconcile::ReconcileEngine::new(
                fix.store.clone(),
                blind_venue,
            )),
            Arc::new(AlertManager::new(Arc::new(crate::alerts::TracingNotifier))),
        )
        .with_pending_policy(1, 3);

        let result = blind_engine.execute(&cand, &dec, &snap, &lock).await.unwrap();
        assert!(matches!(
            result,
            ExecutionResult::Halted(HaltReason::OrphanRisk)
        ));
        assert_eq!(
            fix.sm.current(now_ms()).unwrap().state,
            TradingState::Halted
        );
    }

    #[tokio::test]
    async fn halt_race_inflight_submit_completes_then_barrier_holds() {
        // A submit that is already past the gate completes its single
        // outbound request even if /halt lands mid-flight; the fill is
        // recorded and no further submit begins.
        use tokio::sync::Notify;

        struct SlowVenue {
            release: Arc<Notify>,
            entered: Arc<Notify>,
        }
        #[async_trait::async_trait]
        impl VenueClient for SlowVenue {
            async fn server_time_ms(&self) -> Result<i64> {
                Ok(0)
            }
            async fn balance_cents(&self) -> Result<i64> {
                Ok(0)
            }
            async fn open_orders(&self) -> Result<Vec<VenueOrder>> {
                Ok(vec![])
            }
            async fn fills_since(&self, _: i64) -> Result<Vec<crate::venue::VenueFill>> {
                Ok(vec![])
            }
            async fn positions(&self) -> Result<Vec<crate::venue::VenuePosition>> {
                Ok(vec![])
            }
            async fn find_order(&self, _: &str) -> Result<Option<VenueOrder>> {
                Ok(None)
            }
            async fn submit_limit_order(
                &self,
                req: &SubmitRequest,
            ) -> crate::types::Outcome<SubmittedOrder> {
                self.entered.notify_one();
                self.release.notified().await;
                crate::types::Outcome::Success(SubmittedOrder {
                    exchange_order_id: "x-race".into(),
                    status: "FILLED".into(),
                    filled_cents: req.size_cents,
                })
            }
            async fn cancel_order(&self, _: &str, _: &str) -> crate::types::Outcome<()> {
                crate::types::Outcome::Success(())
            }
        }

        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);
        let (cand, dec, snap, lock) = green_setup(&fix, now_ms());

        let slow_venue: Arc<dyn VenueClient> = Arc::new(SlowVenue {
            release: release.clone(),
            entered: entered.clone(),
        });
        let slow_engine = Arc::new(
            ExecutionEngine::new(
                fix.app.clone(),
                fix.store.clone(),
                Arc::new(Wal::open(fix.wal_path.clone()).unwrap()),
                slow_venue.clone(),
                fix.sm.clone(),
                fix.locks.clone(),
                Arc::new(PaperEngine::new(0.001)),
                fix.snapshots.clone(),
                Arc::new(reconcile::ReconcileEngine::new(
                    fix.store.clone(),
                    slow_venue,
                )),
                Arc::new(AlertManager::new(Arc::new(crate::alerts::TracingNotifier))),
            )
            .with_pending_policy(1, 3),
        );

        let task = {
            let engine = slow_engine.clone();
            let (cand, dec, snap, lock) = (cand.clone(), dec.clone(), snap.clone(), lock.clone());
            tokio::spawn(async move { engine.execute(&cand, &dec, &snap, &lock).await })
        };

        // Wait until the request is in flight, then halt.
        entered.notified().await;
        fix.app.raise_barrier();
        fix.sm.halt(HaltReason::Operator, now_ms()).unwrap();
        release.notify_one();

        let result = task.await.unwrap().unwrap();
        let ExecutionResult::Submitted(order) = result else {
            panic!("expected the in-flight submit to complete, got {result}");
        };
        assert_eq!(order.status, OrderStatus::Filled);

        // Durably persisted, state HALTED, and no further submit passes.
        assert!(fix
            .store
            .get_order_by_client_id(&dec.client_order_id)
            .unwrap()
            .is_some());
        assert_eq!(
            fix.sm.current(now_ms()).unwrap().state,
            TradingState::Halted
        );

        let t2 = now_ms();
        let verdict = slow_engine
            .pre_exec_gate(&cand, &dec, &snap, &lock, fix.app.barrier_generation(), t2)
            .unwrap();
        assert!(matches!(verdict, GateDecision::Abort(_)));
    }

    #[tokio::test]
    async fn stale_residual_is_cancelled() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);

        let mut order = Order {
            id: "ord-r".into(),
            decision_id: "dec-r".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status: OrderStatus::PartiallyFilled,
            client_order_id: "client-r".into(),
            exchange_order_id: Some("x-r".into()),
            price_micros: 430_000,
            size_cents: 2_000,
            filled_cents: 500,
            residual_cents: 1_500,
            pending_unknown_since_ms: None,
            created_at_ms: now - 60_000,
            updated_at_ms: now - RESIDUAL_MAX_AGE_MS - 1_000,
            paper: false,
        };
        fix.store.upsert_order(&order).unwrap();
        fix.venue.push_cancel_outcome(crate::types::Outcome::Success(()));

        fix.engine.cancel_stale_residuals().await.unwrap();

        order = fix.store.get_order_by_client_id("client-r").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.residual_cents, 0);
        assert_eq!(fix.venue.cancelled.lock().as_slice(), ["x-r"]);

        // CANCEL_INTENT then CANCEL_RESULT in the WAL.
        let kinds: Vec<WalRecordKind> = Wal::read_all(&fix.wal_path)
            .unwrap()
            .iter()
            .map(|r| r.kind)
            .collect();
        assert!(kinds.contains(&WalRecordKind::CancelIntent));
        assert!(kinds.contains(&WalRecordKind::CancelResult));
    }

    #[tokio::test]
    async fn ambiguous_cancel_resolves_or_halts() {
        let fix = fixture();
        let now = now_ms();
        enter_live(&fix, now);

        let order = Order {
            id: "ord-a".into(),
            decision_id: "dec-a".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status: OrderStatus::Open,
            client_order_id: "client-a".into(),
            exchange_order_id: Some("x-a".into()),
            price_micros: 430_000,
            size_cents: 2_000,
            filled_cents: 0,
            residual_cents: 2_000,
            pending_unknown_since_ms: None,
            created_at_ms: now - 60_000,
            updated_at_ms: now - RESIDUAL_MAX_AGE_MS - 1_000,
            paper: false,
        };
        fix.store.upsert_order(&order).unwrap();
        fix.venue
            .push_cancel_outcome(crate::types::Outcome::Ambiguous("504".into()));
        // find_order returns None (no orders scripted): cancel confirmed absent.

        fix.engine.cancel_stale_residuals().await.unwrap();
        let resolved = fix.store.get_order_by_client_id("client-a").unwrap().unwrap();
        assert_eq!(resolved.status, OrderStatus::Cancelled);
        assert_ne!(
            fix.sm.current(now_ms()).unwrap().state,
            TradingState::Halted
        );
    }

    #[tokio::test]
    async fn fill_during_cancel_requested_becomes_partially_filled() {
        let fix = fixture();
        let now = now_ms();

        let mut order = Order {
            id: "ord-f".into(),
            decision_id: "dec-f".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status: OrderStatus::CancelRequested,
            client_order_id: "client-f".into(),
            exchange_order_id: Some("x-f".into()),
            price_micros: 430_000,
            size_cents: 2_000,
            filled_cents: 0,
            residual_cents: 2_000,
            pending_unknown_since_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
            paper: false,
        };
        fix.store.upsert_order(&order).unwrap();

        fix.engine.apply_fill(&mut order, 800, now + 1).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.residual_cents, 1_200);

        fix.engine.apply_fill(&mut order, 1_200, now + 2).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.residual_cents, 0);
    }

    #[tokio::test]
    async fn orphan_adoption_creates_pending_unknown() {
        let fix = fixture();
        let intent = OrderIntentRecord {
            client_order_id: "orphan-1".into(),
            decision_id: "dec-o".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            price_micros: 430_000,
            size_cents: 2_000,
        };
        let order = fix.engine.adopt_orphan(&intent, 1_000).unwrap();
        assert_eq!(order.status, OrderStatus::PendingUnknown);
        assert_eq!(fix.store.pending_unknown_count().unwrap(), 1);
    }

    fn orphan_intent(client_id: &str) -> OrderIntentRecord {
        OrderIntentRecord {
            client_order_id: client_id.into(),
            decision_id: format!("dec-{client_id}"),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            price_micros: 430_000,
            size_cents: 2_000,
        }
    }

    #[tokio::test]
    async fn startup_sweep_resolves_adopted_orphan_as_absent() {
        let fix = fixture();
        fix.engine.adopt_orphan(&orphan_intent("orphan-a"), 1_000).unwrap();
        // Venue has no such order: the sweep confirms it absent.

        let resolved = fix
            .engine
            .resolve_outstanding_pending_unknown(0)
            .await
            .unwrap();
        assert_eq!(resolved, 1);

        let order = fix.store.get_order_by_client_id("orphan-a").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        // Nothing blocks RECONCILE_GREEN on this axis any more, and the
        // market is cooling off.
        assert_eq!(fix.store.pending_unknown_count().unwrap(), 0);
        assert!(fix.app.market_in_cooloff("mkt-1", now_ms()));
        assert_ne!(
            fix.sm.current(now_ms()).unwrap().state,
            TradingState::Halted
        );
    }

    #[tokio::test]
    async fn startup_sweep_adopts_found_orphan() {
        let fix = fixture();
        fix.engine.adopt_orphan(&orphan_intent("orphan-f"), 1_000).unwrap();
        fix.venue.add_lookup_order(VenueOrder {
            client_order_id: "orphan-f".into(),
            exchange_order_id: "x-orphan".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            price: 0.43,
            size_cents: 2_000,
            filled_cents: 0,
            status: "OPEN".into(),
        });

        let resolved = fix
            .engine
            .resolve_outstanding_pending_unknown(0)
            .await
            .unwrap();
        assert_eq!(resolved, 1);

        let order = fix.store.get_order_by_client_id("orphan-f").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.exchange_order_id.as_deref(), Some("x-orphan"));
        assert_eq!(fix.store.pending_unknown_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_min_age_skips_fresh_pending_unknown() {
        let fix = fixture();
        // Adopted just now: a heartbeat-style sweep must leave it to the
        // loop that owns it.
        fix.engine
            .adopt_orphan(&orphan_intent("orphan-n"), now_ms())
            .unwrap();

        let resolved = fix
            .engine
            .resolve_outstanding_pending_unknown(PENDING_SWEEP_MIN_AGE_MS)
            .await
            .unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(fix.store.pending_unknown_count().unwrap(), 1);
    }
}
