// =============================================================================
// Operator Control Surface — Axum 0.7
// =============================================================================
//
// The local REST transport for the operator control channel. The health
// endpoint is public; everything else requires the operator bearer token.
// Command handlers delegate to the state machine; /halt additionally
// raises the barrier so in-flight submits cannot be followed by new ones.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alerts::{AlertKind, AlertManager};
use crate::api::auth::OperatorAuth;
use crate::app_state::AppState;
use crate::event_store::EventStore;
use crate::state_machine::StateMachine;
use crate::types::HaltReason;

/// Shared context handed to every handler.
pub struct ApiContext {
    pub app: Arc<AppState>,
    pub state_machine: Arc<StateMachine>,
    pub store: EventStore,
    pub alerts: Arc<AlertManager>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build the control router with CORS middleware and shared context.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/control/halt", post(halt))
        .route("/api/v1/control/unhalt", post(unhalt))
        .route("/api/v1/control/resume_paper", post(resume_paper))
        .route("/api/v1/control/arm_live", post(arm_live))
        .route("/api/v1/control/confirm_live_step1", post(confirm_step1))
        .route("/api/v1/control/confirm_live_step2", post(confirm_step2))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "state_version": ctx.app.current_state_version(),
        "server_time": now_ms(),
    }))
}

// =============================================================================
// Status
// =============================================================================

async fn status(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> Json<serde_json::Value> {
    let now = now_ms();
    let state = ctx
        .state_machine
        .current(now)
        .map(|s| s.state.as_str().to_string())
        .unwrap_or_else(|_| "UNREADABLE".to_string());

    let blockers: Vec<&'static str> = ctx.app.blockers().iter().map(|b| b.as_str()).collect();
    let feed = ctx.app.feed_status();
    let reconcile_age_s = match ctx.app.last_reconcile_completed_ms() {
        0 => None,
        t => Some((now - t) / 1_000),
    };
    let pending_unknown = ctx.store.pending_unknown_count().unwrap_or(-1);
    let active_mismatches = crate::reconcile::active_l2_l3_count(&ctx.store).unwrap_or(-1);
    let wallet = ctx.app.wallet_ref();

    Json(json!({
        "state": state,
        "blockers": blockers,
        "barrier_active": ctx.app.barrier_active(),
        "barrier_generation": ctx.app.barrier_generation(),
        "ws": {
            "connected": feed.connected,
            "epoch": feed.current_epoch,
            "last_message_age_ms": if feed.ws_last_message_ms > 0 { Some(now - feed.ws_last_message_ms) } else { None },
        },
        "reconcile_last_ok_age_s": reconcile_age_s,
        "pending_unknown_orders": pending_unknown,
        "active_l2_l3_mismatches": active_mismatches,
        "wallet_ref_cents": wallet.map(|w| w.cents),
        "wallet_ref_age_ms": wallet.map(|w| now - w.updated_at_ms),
        "recent_no_trade": ctx.app.recent_no_trade(),
        "uptime_s": ctx.app.start_time.elapsed().as_secs(),
        "state_version": ctx.app.current_state_version(),
    }))
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Deserialize)]
struct TotpBody {
    totp: String,
}

#[derive(Deserialize)]
struct Step1Body {
    nonce1: String,
    totp: String,
}

#[derive(Deserialize)]
struct Step2Body {
    nonce2: String,
    totp: String,
}

fn command_err(e: anyhow::Error) -> Json<serde_json::Value> {
    Json(json!({ "ok": false, "error": e.to_string() }))
}

/// `/halt`: raise the barrier first so the generation changes before the
/// durable transition, then persist HALTED.
async fn halt(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> Json<serde_json::Value> {
    let now = now_ms();
    let generation = ctx.app.raise_barrier();
    match ctx.state_machine.halt(HaltReason::Operator, now) {
        Ok(state) => {
            ctx.alerts.emit(
                AlertKind::Halted,
                "halt-operator",
                "engine halted by operator",
                now,
            );
            info!(generation, "operator halt");
            Json(json!({ "ok": true, "state": state.state.as_str(), "barrier_generation": generation }))
        }
        Err(e) => command_err(e),
    }
}

async fn unhalt(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<TotpBody>,
) -> Json<serde_json::Value> {
    let now = now_ms();
    match ctx.state_machine.unhalt(&body.totp, now) {
        Ok(state) => {
            ctx.app.lower_barrier();
            Json(json!({ "ok": true, "state": state.state.as_str() }))
        }
        Err(e) => command_err(e),
    }
}

async fn resume_paper(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<TotpBody>,
) -> Json<serde_json::Value> {
    match ctx.state_machine.resume_paper(&body.totp, now_ms()) {
        Ok(state) => Json(json!({ "ok": true, "state": state.state.as_str() })),
        Err(e) => command_err(e),
    }
}

async fn arm_live(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
) -> Json<serde_json::Value> {
    match ctx.state_machine.arm_live_init(now_ms()) {
        Ok(nonce1) => Json(json!({ "ok": true, "nonce1": nonce1, "ttl_s": 120 })),
        Err(e) => command_err(e),
    }
}

async fn confirm_step1(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<Step1Body>,
) -> Json<serde_json::Value> {
    match ctx
        .state_machine
        .confirm_step1(&body.nonce1, &body.totp, now_ms())
    {
        Ok(nonce2) => Json(json!({
            "ok": true,
            "state": "LIVE_ARMED",
            "nonce2": nonce2,
            "armed_window_s": 300,
        })),
        Err(e) => command_err(e),
    }
}

async fn confirm_step2(
    _auth: OperatorAuth,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<Step2Body>,
) -> Json<serde_json::Value> {
    let now = now_ms();
    match ctx.state_machine.confirm_step2(
        &body.nonce2,
        &body.totp,
        ctx.app.process_start_unix_ms,
        now,
    ) {
        Ok(state) => {
            ctx.alerts.emit(
                AlertKind::LiveTransition,
                "live-armed",
                "engine entered LIVE_TRADING",
                now,
            );
            Json(json!({ "ok": true, "state": state.state.as_str() }))
        }
        Err(e) => command_err(e),
    }
}
