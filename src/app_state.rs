// =============================================================================
// Central Application State — PolyEdge coordinator
// =============================================================================
//
// The single owner of process-global mutable state: the barrier and its
// generation counter, the WS feed status (connected flag, epoch, last
// message time), the blocker set, the wallet reference, reconcile
// completion time, and per-market cool-offs. Everything else reads and
// writes this state only through the methods here, never ambiently.
//
// Thread safety:
//   - Atomics for the barrier, WS feed, and version counters.
//   - parking_lot::RwLock for mutable collections.
//   - A tokio Mutex as the process-global SUBMIT_GATE serializing outbound
//     venue submissions.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{Manifest, RuntimeConfig};
use crate::snapshot::FeedStatus;
use crate::types::{Blocker, Cents, ReasonCode};

/// Maximum number of recent NO_TRADE records retained for the status API.
const MAX_RECENT_NO_TRADE: usize = 100;

/// A recorded NO_TRADE outcome for the operator status view.
#[derive(Debug, Clone, Serialize)]
pub struct NoTradeRecord {
    pub market_id: String,
    pub reason: ReasonCode,
    pub at_ms: i64,
}

/// Wallet reference with its refresh time. Refreshes only from TWAP- or
/// trade-backed marks.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WalletRef {
    pub cents: Cents,
    pub updated_at_ms: i64,
}

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub manifest: Manifest,

    // ── Barrier ─────────────────────────────────────────────────────────
    barrier: AtomicBool,
    barrier_generation: AtomicU64,

    // ── WS feed status ──────────────────────────────────────────────────
    ws_connected: AtomicBool,
    ws_epoch: AtomicU64,
    ws_last_message_ms: AtomicI64,

    // ── Blockers ────────────────────────────────────────────────────────
    blockers: RwLock<HashSet<Blocker>>,

    // ── Wallet reference ────────────────────────────────────────────────
    wallet: RwLock<Option<WalletRef>>,

    // ── Reconciliation ──────────────────────────────────────────────────
    last_reconcile_completed_ms: AtomicI64,

    // ── Per-market cool-off after ABSENT_CONFIRMED ──────────────────────
    cooloff_until_ms: RwLock<HashMap<String, i64>>,

    // ── Submission serialization ────────────────────────────────────────
    /// Process-global gate: at most one outbound venue submission at a
    /// time. AI calls and reconciliation reads are not gated.
    pub submit_gate: tokio::sync::Mutex<()>,

    // ── NO_TRADE audit trail ────────────────────────────────────────────
    recent_no_trade: RwLock<Vec<NoTradeRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
    /// Process start in UNIX ms; pinned into the arming file.
    pub process_start_unix_ms: i64,
}

impl AppState {
    pub fn new(config: RuntimeConfig, manifest: Manifest) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            manifest,
            barrier: AtomicBool::new(false),
            barrier_generation: AtomicU64::new(0),
            ws_connected: AtomicBool::new(false),
            ws_epoch: AtomicU64::new(0),
            ws_last_message_ms: AtomicI64::new(0),
            blockers: RwLock::new(HashSet::new()),
            wallet: RwLock::new(None),
            last_reconcile_completed_ms: AtomicI64::new(0),
            cooloff_until_ms: RwLock::new(HashMap::new()),
            submit_gate: tokio::sync::Mutex::new(()),
            recent_no_trade: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
            process_start_unix_ms: Utc::now().timestamp_millis(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Barrier ─────────────────────────────────────────────────────────

    /// Raise the barrier and bump the generation. Called on every /halt;
    /// in-flight submits observe the generation change at their gate.
    pub fn raise_barrier(&self) -> u64 {
        self.barrier.store(true, Ordering::SeqCst);
        let generation = self.barrier_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.increment_version();
        generation
    }

    /// Lower the barrier (after a verified unhalt). The generation counter
    /// never decreases.
    pub fn lower_barrier(&self) {
        self.barrier.store(false, Ordering::SeqCst);
        self.increment_version();
    }

    pub fn barrier_active(&self) -> bool {
        self.barrier.load(Ordering::SeqCst)
    }

    pub fn barrier_generation(&self) -> u64 {
        self.barrier_generation.load(Ordering::SeqCst)
    }

    // ── WS feed ─────────────────────────────────────────────────────────

    pub fn ws_set_connected(&self, connected: bool) {
        self.ws_connected.store(connected, Ordering::SeqCst);
        if !connected {
            // Every disconnect invalidates all snapshots from the old epoch.
            self.ws_epoch.fetch_add(1, Ordering::SeqCst);
            self.set_blocker(Blocker::WsDown);
        } else {
            self.clear_blocker(Blocker::WsDown);
        }
        self.increment_version();
    }

    pub fn ws_note_message(&self, now_ms: i64) {
        self.ws_last_message_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn ws_epoch(&self) -> u64 {
        self.ws_epoch.load(Ordering::SeqCst)
    }

    pub fn feed_status(&self) -> FeedStatus {
        FeedStatus {
            connected: self.ws_connected.load(Ordering::SeqCst),
            current_epoch: self.ws_epoch(),
            ws_last_message_ms: self.ws_last_message_ms.load(Ordering::SeqCst),
        }
    }

    // ── Blockers ────────────────────────────────────────────────────────

    pub fn set_blocker(&self, blocker: Blocker) {
        if self.blockers.write().insert(blocker) {
            tracing::warn!(blocker = %blocker, "blocker set");
            self.increment_version();
        }
    }

    pub fn clear_blocker(&self, blocker: Blocker) {
        if self.blockers.write().remove(&blocker) {
            tracing::info!(blocker = %blocker, "blocker cleared");
            self.increment_version();
        }
    }

    pub fn blocker_set(&self, blocker: Blocker) -> bool {
        self.blockers.read().contains(&blocker)
    }

    pub fn blockers(&self) -> Vec<Blocker> {
        let mut list: Vec<Blocker> = self.blockers.read().iter().copied().collect();
        list.sort_by_key(|b| b.as_str());
        list
    }

    /// Any set blocker forbids new exposure.
    pub fn no_new_exposure(&self) -> bool {
        !self.blockers.read().is_empty()
    }

    /// PAPER may continue only when every set blocker tolerates it.
    pub fn paper_inhibited(&self) -> bool {
        self.blockers.read().iter().any(|b| !b.paper_tolerated())
    }

    // ── Wallet reference ────────────────────────────────────────────────

    pub fn set_wallet_ref(&self, cents: Cents, now_ms: i64) {
        *self.wallet.write() = Some(WalletRef {
            cents,
            updated_at_ms: now_ms,
        });
        self.increment_version();
    }

    pub fn wallet_ref(&self) -> Option<WalletRef> {
        *self.wallet.read()
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    pub fn note_reconcile_completed(&self, now_ms: i64) {
        self.last_reconcile_completed_ms.store(now_ms, Ordering::SeqCst);
        self.increment_version();
    }

    pub fn last_reconcile_completed_ms(&self) -> i64 {
        self.last_reconcile_completed_ms.load(Ordering::SeqCst)
    }

    // ── Market cool-off ─────────────────────────────────────────────────

    pub fn set_market_cooloff(&self, market_id: &str, until_ms: i64) {
        self.cooloff_until_ms
            .write()
            .insert(market_id.to_string(), until_ms);
    }

    pub fn market_in_cooloff(&self, market_id: &str, now_ms: i64) -> bool {
        self.cooloff_until_ms
            .read()
            .get(market_id)
            .is_some_and(|&until| now_ms < until)
    }

    // ── NO_TRADE audit ──────────────────────────────────────────────────

    pub fn record_no_trade(&self, market_id: &str, reason: ReasonCode, now_ms: i64) {
        let mut records = self.recent_no_trade.write();
        records.push(NoTradeRecord {
            market_id: market_id.to_string(),
            reason,
            at_ms: now_ms,
        });
        while records.len() > MAX_RECENT_NO_TRADE {
            records.remove(0);
        }
        self.increment_version();
    }

    pub fn recent_no_trade(&self) -> Vec<NoTradeRecord> {
        self.recent_no_trade.read().clone()
    }
}
