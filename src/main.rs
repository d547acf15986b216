// =============================================================================
// PolyEdge — Main Entry Point
// =============================================================================
//
// The engine never starts trading on its own: any persisted LIVE state is
// downgraded to OBSERVE_ONLY during the ordered startup sequence below, and
// LIVE is reachable again only through the two-step arming ceremony within
// this process lifetime. No worker starts before the sequence completes.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod budget;
mod config;
mod decision;
mod event_store;
mod execution;
mod locks;
mod paper;
mod reconcile;
mod risk;
mod snapshot;
mod state_machine;
mod totp;
mod types;
mod venue;
mod wal;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertKind, AlertManager, TracingNotifier};
use crate::app_state::AppState;
use crate::budget::BudgetManager;
use crate::config::{verify_secret_file_permissions, Manifest, RuntimeConfig};
use crate::event_store::EventStore;
use crate::execution::ExecutionEngine;
use crate::locks::LockManager;
use crate::paper::PaperEngine;
use crate::reconcile::ReconcileEngine;
use crate::risk::RiskManager;
use crate::snapshot::SnapshotStore;
use crate::state_machine::{ArmingFilePolicy, StateMachine};
use crate::totp::TotpValidator;
use crate::types::{Blocker, HaltReason, TradingState};
use crate::venue::{rest::RestVenueClient, VenueClient};
use crate::wal::Wal;
use crate::worker::{MarketRegistry, NoAdvisor, WorkerDeps};

/// Tolerated clock drift against database and venue UTC.
const MAX_CLOCK_SKEW_MS: i64 = 5_000;
/// Budget reaper cadence.
const REAPER_INTERVAL_S: u64 = 30;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn env_secret(name: &str) -> Result<Vec<u8>> {
    let value = std::env::var(name).with_context(|| format!("missing secret env {name}"))?;
    if value.is_empty() {
        anyhow::bail!("secret env {name} is empty");
    }
    Ok(value.into_bytes())
}

/// Registry stub until the market-registry synchroniser connects: every
/// watchlist market is eligible with the venue's flat fee.
struct WatchlistRegistry {
    fee_rate: f64,
}

impl MarketRegistry for WatchlistRegistry {
    fn eligible(&self, _market_id: &str) -> bool {
        true
    }
    fn fee_rate(&self, _market_id: &str) -> f64 {
        self.fee_rate
    }
    fn days_to_resolution(&self, _market_id: &str, _now_ms: i64) -> f64 {
        7.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Environment & logging ────────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              PolyEdge — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // Secrets file (dotenv format) with enforced permissions.
    let secrets_path =
        std::env::var("POLYEDGE_SECRETS_FILE").unwrap_or_else(|_| ".secrets".to_string());

    // Stores and durability come up before the numbered sequence so that
    // any failure below can be persisted as HALTED.
    let store = EventStore::open(&config.db_path)?;
    let wal = Arc::new(Wal::open(&config.wal_path)?);
    let alerts = Arc::new(AlertManager::new(Arc::new(TracingNotifier)));

    // ── 2. Secret-file permissions ───────────────────────────────────────
    // (Checked before the secrets are read; the manifest secret comes from
    // this file.)
    if let Err(e) = verify_secret_file_permissions(&secrets_path) {
        error!(error = %e, "secret file permission check failed");
        // The state secret may be unreadable; halt with a throwaway secret
        // so the row is at least unusable rather than absent.
        let sm = StateMachine::new(
            store.clone(),
            wal.clone(),
            b"invalid".to_vec(),
            b"invalid".to_vec(),
            TotpValidator::new(b"invalid".to_vec()),
            ArmingFilePolicy {
                path: config.arming_file_path.clone(),
                expected_uid: None,
                expected_gid: None,
                expected_mode: 0o640,
            },
        );
        let _ = sm.force_halted(HaltReason::SecretPermissions, now_ms());
        anyhow::bail!("secret file permissions invalid: {e}");
    }
    let _ = dotenv::from_path(&secrets_path);

    let state_secret = env_secret("POLYEDGE_STATE_SECRET")?;
    let local_secret = env_secret("POLYEDGE_LOCAL_STATE_SECRET")?;
    let totp_secret = env_secret("POLYEDGE_TOTP_SECRET")?;
    let manifest_secret = env_secret("POLYEDGE_MANIFEST_SECRET")?;

    let polyedge_gid: Option<u32> = std::env::var("POLYEDGE_ARMING_GID")
        .ok()
        .and_then(|v| v.parse().ok());
    let arming_policy = match polyedge_gid {
        Some(gid) => ArmingFilePolicy::production(config.arming_file_path.clone(), gid),
        None => ArmingFilePolicy {
            path: config.arming_file_path.clone(),
            expected_uid: None,
            expected_gid: None,
            expected_mode: 0o640,
        },
    };

    let state_machine = Arc::new(StateMachine::new(
        store.clone(),
        wal.clone(),
        state_secret,
        local_secret,
        TotpValidator::new(totp_secret),
        arming_policy,
    ));

    // ── 1. Signed config manifest ────────────────────────────────────────
    let manifest = match Manifest::load_verified(&config.manifest_path, &manifest_secret)
        .and_then(|m| {
            m.verify_artifacts(".")?;
            Ok(m)
        }) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!(error = %e, "config manifest verification failed");
            alerts.emit(
                AlertKind::ConfigTamper,
                "manifest",
                format!("manifest verification failed: {e}"),
                now_ms(),
            );
            let _ = state_machine.force_halted(HaltReason::ConfigTamper, now_ms());
            anyhow::bail!("config manifest verification failed: {e}");
        }
    };

    let app = Arc::new(AppState::new(config.clone(), manifest));

    // ── Venue client ─────────────────────────────────────────────────────
    let api_key = std::env::var("POLYEDGE_VENUE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("POLYEDGE_VENUE_API_SECRET").unwrap_or_default();
    let venue_url = std::env::var("POLYEDGE_VENUE_URL")
        .unwrap_or_else(|_| "https://api.venue.example".to_string());
    let venue: Arc<dyn VenueClient> =
        Arc::new(RestVenueClient::new(api_key, api_secret, venue_url));

    // ── 3. Clock-drift probe ─────────────────────────────────────────────
    match venue.server_time_ms().await {
        Ok(venue_time) => {
            let skew = (now_ms() - venue_time).abs();
            if skew > MAX_CLOCK_SKEW_MS {
                warn!(skew_ms = skew, "clock skew beyond tolerance");
                app.set_blocker(Blocker::ClockSkew);
                alerts.emit(
                    AlertKind::ClockSkew,
                    "clock-skew",
                    format!("clock skew {skew} ms against venue"),
                    now_ms(),
                );
                let _ = state_machine.downgrade_to_observe("CLOCK_SKEW", now_ms());
            }
        }
        Err(e) => warn!(error = %e, "venue time probe failed — proceeding in OBSERVE_ONLY"),
    }

    // ── 4. Read and verify BotState ──────────────────────────────────────
    let startup_state = state_machine.current(now_ms())?;
    info!(state = %startup_state.state, "durable state verified");
    if startup_state.state == TradingState::Halted {
        warn!("engine is HALTED; operator unhalt required before trading");
    }

    // ── 5. Forced LIVE downgrade ─────────────────────────────────────────
    let pre_downgrade = startup_state.state;
    let state = state_machine.startup_downgrade(now_ms())?;
    if pre_downgrade != state.state {
        alerts.emit(
            AlertKind::StartupDowngrade,
            "startup-downgrade",
            format!("persisted {pre_downgrade} downgraded to OBSERVE_ONLY"),
            now_ms(),
        );
    }

    // ── 6. Remove stale arming file ──────────────────────────────────────
    if let Err(e) = state_machine.remove_arming_file() {
        let _ = state_machine.force_halted(HaltReason::StartupFailure, now_ms());
        anyhow::bail!("failed to remove arming file: {e}");
    }

    // ── 7. Invalidate arming nonces ──────────────────────────────────────
    if let Err(e) = state_machine.invalidate_nonces() {
        let _ = state_machine.force_halted(HaltReason::StartupFailure, now_ms());
        anyhow::bail!("failed to invalidate arming nonces: {e}");
    }

    // ── Shared engines ───────────────────────────────────────────────────
    let snapshots = Arc::new(SnapshotStore::new(Some(store.clone())));
    let locks = Arc::new(LockManager::new(
        store.clone(),
        format!("polyedge-{}", std::process::id()),
    ));
    let paper = Arc::new(PaperEngine::new(app.manifest.venue_tick));
    let risk = Arc::new(RiskManager::new());
    let budget = Arc::new(BudgetManager::new(store.clone()));
    let reconciler = Arc::new(ReconcileEngine::new(store.clone(), venue.clone()));
    let execution = Arc::new(ExecutionEngine::new(
        app.clone(),
        store.clone(),
        wal.clone(),
        venue.clone(),
        state_machine.clone(),
        locks.clone(),
        paper.clone(),
        snapshots.clone(),
        reconciler.clone(),
        alerts.clone(),
    ));

    // ── 8. WAL replay into the event store ───────────────────────────────
    match Wal::read_all(&config.wal_path) {
        Ok(records) => {
            for record in &records {
                let payload = serde_json::json!({
                    "wal_offset": record.offset,
                    "kind": record.kind,
                    "payload": record.payload,
                });
                if let Err(e) = store.append_event("WAL_REPLAY", None, &payload, record.ts_ms) {
                    let _ = state_machine.force_halted(HaltReason::WalReplayFailed, now_ms());
                    anyhow::bail!("WAL replay failed: {e}");
                }
            }
            let orphans = wal::orphaned_intents(&records);
            for intent in &orphans {
                if store.get_order_by_client_id(&intent.client_order_id)?.is_none() {
                    execution.adopt_orphan(intent, now_ms())?;
                }
            }
            info!(
                records = records.len(),
                orphans = orphans.len(),
                "WAL replayed"
            );
        }
        Err(e) => {
            let _ = state_machine.force_halted(HaltReason::WalReplayFailed, now_ms());
            anyhow::bail!("WAL replay failed: {e}");
        }
    }

    // ── 9. Initial reconciliation ────────────────────────────────────────
    // Adopted orphans resolve first (FOUND / ABSENT_CONFIRMED / halt);
    // RECONCILE_GREEN can never hold while any PENDING_UNKNOWN remains.
    match execution.resolve_outstanding_pending_unknown(0).await {
        Ok(resolved) if resolved > 0 => {
            info!(resolved, "adopted orphans resolved");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "orphan resolution failed"),
    }

    let wallet_guess = app.wallet_ref().map(|w| w.cents).unwrap_or(0);
    match reconciler.run_cycle(wallet_guess, now_ms()).await {
        Ok(report) => {
            app.note_reconcile_completed(now_ms());
            info!(matched = report.orders_matched, "initial reconciliation complete");
        }
        Err(e) => {
            warn!(error = %e, "initial reconciliation failed — staying out of the market");
            app.set_blocker(Blocker::ReconcileDegraded);
        }
    }

    // ── 10. Wallet reference ─────────────────────────────────────────────
    match venue.balance_cents().await {
        Ok(balance) => {
            app.set_wallet_ref(balance, now_ms());
            info!(balance_cents = balance, "wallet reference fetched");
        }
        Err(e) => warn!(error = %e, "wallet fetch failed — remaining OBSERVE_ONLY"),
    }

    // ── 11. Workers ──────────────────────────────────────────────────────
    let registry: Arc<dyn MarketRegistry> = Arc::new(WatchlistRegistry { fee_rate: 0.002 });
    let deps = Arc::new(WorkerDeps {
        app: app.clone(),
        store: store.clone(),
        snapshots: snapshots.clone(),
        locks: locks.clone(),
        risk: risk.clone(),
        budget: budget.clone(),
        execution: execution.clone(),
        state_machine: state_machine.clone(),
        registry,
        advisor: Arc::new(NoAdvisor),
    });

    // Market workers.
    let markets = app.runtime_config.read().markets.clone();
    for market in &markets {
        tokio::spawn(worker::run_market_worker(deps.clone(), market.clone()));
    }
    info!(count = markets.len(), "market workers launched");

    // WS ingest with reconnect.
    {
        let ws_url = std::env::var("POLYEDGE_VENUE_WS_URL")
            .unwrap_or_else(|_| "wss://stream.venue.example/ws".to_string());
        let app = app.clone();
        let snapshots = snapshots.clone();
        let markets = markets.clone();
        let reconciler = reconciler.clone();
        let alerts = alerts.clone();
        tokio::spawn(async move {
            let ingest = Arc::new(venue::ws::IngestState::new());
            loop {
                if let Err(e) =
                    venue::ws::run_market_stream(&ws_url, &markets, &app, &snapshots, &ingest)
                        .await
                {
                    error!(error = %e, "market stream error — reconnecting in 5s");
                }
                alerts.emit(
                    AlertKind::WsDown,
                    "ws-down",
                    "market WebSocket disconnected",
                    now_ms(),
                );
                // Reconcile across the connection gap before trading can
                // resume on the new epoch.
                let wallet = app.wallet_ref().map(|w| w.cents).unwrap_or(0);
                if reconciler.run_cycle(wallet, now_ms()).await.is_ok() {
                    app.note_reconcile_completed(now_ms());
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
    }

    // Paper fill monitor.
    {
        let snapshots = snapshots.clone();
        let paper = paper.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                let now = now_ms();
                for market in snapshots.markets() {
                    if let Some(snap) = snapshots.latest(&market) {
                        paper.on_snapshot(&snap, now, &store);
                    }
                }
            }
        });
    }

    // Reconciliation heartbeat + residual cancellation + daily stop.
    {
        let app = app.clone();
        let reconciler = reconciler.clone();
        let execution = execution.clone();
        let risk = risk.clone();
        let state_machine = state_machine.clone();
        let alerts = alerts.clone();
        let heartbeat = app.runtime_config.read().reconcile_heartbeat_s;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(heartbeat));
            loop {
                interval.tick().await;
                let now = now_ms();
                let wallet = app.wallet_ref().map(|w| w.cents).unwrap_or(0);

                match reconciler.run_cycle(wallet, now).await {
                    Ok(report) => {
                        app.note_reconcile_completed(now_ms());
                        app.clear_blocker(Blocker::ReconcileDegraded);
                        if report.l1_escalated {
                            alerts.emit(
                                AlertKind::MismatchEscalated,
                                "l1-escalation",
                                "cumulative level-1 drift escalated to level-2",
                                now,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "reconciliation heartbeat failed");
                        app.set_blocker(Blocker::ReconcileDegraded);
                    }
                }

                match execution.cancel_stale_residuals().await {
                    Ok(cancelled) if cancelled > 0 => {
                        // Reconcile again after any cancel so the venue
                        // view postdates it.
                        if reconciler.run_cycle(wallet, now_ms()).await.is_ok() {
                            app.note_reconcile_completed(now_ms());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "residual cancellation failed"),
                }

                // Sweep PENDING_UNKNOWN stragglers no resolution loop owns
                // (e.g. left behind by a degraded event store).
                if let Err(e) = execution
                    .resolve_outstanding_pending_unknown(
                        crate::execution::PENDING_SWEEP_MIN_AGE_MS,
                    )
                    .await
                {
                    warn!(error = %e, "pending-unknown sweep failed");
                }

                // Daily stop.
                if wallet > 0 {
                    let config = app.runtime_config.read().clone();
                    if risk.daily_stop_hit(wallet, &config) {
                        warn!("daily stop hit — entering HALTED_DAILY");
                        app.raise_barrier();
                        if state_machine.halt_daily(now_ms()).is_ok() {
                            alerts.emit(
                                AlertKind::HaltedDaily,
                                "daily-stop",
                                "daily loss stop reached; trading blocked until UTC midnight",
                                now_ms(),
                            );
                        }
                    }
                }

                // Wallet reference staleness.
                if let Some(w) = app.wallet_ref() {
                    if risk::wallet_ref_stale(w.updated_at_ms, now_ms()) {
                        alerts.emit(
                            AlertKind::WalletRefStale,
                            "wallet-stale",
                            "wallet reference stale beyond 3600s",
                            now_ms(),
                        );
                        let _ = state_machine.downgrade_to_observe("WALLET_REF_STALE", now_ms());
                    }
                }
            }
        });
    }

    // Budget reaper.
    {
        let app = app.clone();
        let budget = budget.clone();
        let state_machine = state_machine.clone();
        let alerts = alerts.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(REAPER_INTERVAL_S));
            loop {
                interval.tick().await;
                let now = now_ms();
                match budget.reap(now) {
                    Ok(report) => {
                        if report.degrades_cost_accounting() {
                            let live = state_machine
                                .current(now)
                                .map(|s| s.state == TradingState::LiveTrading)
                                .unwrap_or(false);
                            if live {
                                app.set_blocker(Blocker::CostAccountingDegraded);
                                alerts.emit(
                                    AlertKind::CostAccountingDegraded,
                                    "cost-accounting",
                                    "three force-settled reservations today",
                                    now,
                                );
                                let _ = state_machine
                                    .downgrade_to_observe("COST_ACCOUNTING_DEGRADED", now);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "budget reaper failed"),
                }
            }
        });
    }

    // Operator control API.
    {
        let ctx = Arc::new(api::rest::ApiContext {
            app: app.clone(),
            state_machine: state_machine.clone(),
            store: store.clone(),
            alerts: alerts.clone(),
        });
        let bind_addr = app.runtime_config.read().bind_addr.clone();
        tokio::spawn(async move {
            let router = api::rest::router(ctx);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind control API");
            info!(addr = %bind_addr, "control API listening");
            axum::serve(listener, router)
                .await
                .expect("control API failed");
        });
    }

    info!("all subsystems running; press Ctrl+C to stop");

    // ── Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    if let Err(e) = app.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("PolyEdge shut down complete");
    Ok(())
}
