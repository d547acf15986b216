// =============================================================================
// Snapshot Store — immutable price/orderbook snapshots and health predicates
// =============================================================================
//
// A snapshot is never mutated after insert. Both decision and execution
// health checks share one predicate, differing only in the freshness bound
// (decision 6 s, execution 3 s). The WS epoch increments on every
// disconnect; a snapshot carrying a stale epoch is immediately invalid.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::event_store::EventStore;
use crate::types::price_to_micros;

/// Depth levels retained per side.
pub const DEPTH_K: usize = 3;

/// Global WS staleness ceiling, independent of the per-market bound.
const GLOBAL_WS_STALE_MS: i64 = 10_000;

// ---------------------------------------------------------------------------
// Snapshot data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotSource {
    Ws,
    Rest,
}

/// One price level: price in payout-share units, size in USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size_usd: f64,
}

/// Top-of-book plus top-K depth for one outcome token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideBook {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl SideBook {
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// USD resting at the best ask (slippage model input).
    pub fn top_ask_depth_usd(&self) -> f64 {
        self.asks.first().map(|l| l.size_usd).unwrap_or(0.0)
    }
}

/// Immutable per-market market-data record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub market_id: String,
    /// Local receive time, monotonic milliseconds.
    pub snapshot_at_ms: i64,
    pub source: SnapshotSource,
    /// WS epoch at capture; incremented globally on every disconnect.
    pub ws_epoch: u64,
    /// Global last-WS-message time at capture.
    pub ws_last_message_ms: i64,
    /// Last WS update for this market.
    pub market_last_ws_update_ms: i64,
    /// Last time the orderbook content actually changed.
    pub orderbook_last_change_ms: i64,
    pub yes: SideBook,
    pub no: SideBook,
    pub content_hash: String,
    pub invalid_book: bool,
    pub ask_sum_anomaly: bool,
}

impl Snapshot {
    /// Build a snapshot, computing the content hash and anomaly flags.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        market_id: String,
        snapshot_at_ms: i64,
        source: SnapshotSource,
        ws_epoch: u64,
        ws_last_message_ms: i64,
        market_last_ws_update_ms: i64,
        orderbook_last_change_ms: i64,
        yes: SideBook,
        no: SideBook,
    ) -> Self {
        let invalid_book = book_invalid(&yes) || book_invalid(&no);
        // Fixed-point micros keep the 0.98 / 2.00 boundaries exact.
        let ask_sum_anomaly = match (yes.best_ask, no.best_ask) {
            (Some(ay), Some(an)) => {
                let sum_micros = price_to_micros(ay) + price_to_micros(an);
                sum_micros < 980_000 || sum_micros > 2_000_000
            }
            // Missing best is already an invalid book; the ask-sum flag
            // stays unset.
            _ => false,
        };

        let content_hash = content_hash(&market_id, &yes, &no, orderbook_last_change_ms);

        Self {
            id,
            market_id,
            snapshot_at_ms,
            source,
            ws_epoch,
            ws_last_message_ms,
            market_last_ws_update_ms,
            orderbook_last_change_ms,
            yes,
            no,
            content_hash,
            invalid_book,
            ask_sum_anomaly,
        }
    }

    pub fn book(&self, side: crate::types::Side) -> &SideBook {
        match side {
            crate::types::Side::Yes => &self.yes,
            crate::types::Side::No => &self.no,
        }
    }
}

fn book_invalid(book: &SideBook) -> bool {
    let (bid, ask) = match (book.best_bid, book.best_ask) {
        (Some(b), Some(a)) => (b, a),
        // Missing best on either side.
        _ => return true,
    };
    if bid <= 0.0 || bid >= 1.0 || ask <= 0.0 || ask >= 1.0 {
        return true;
    }
    if bid > ask {
        return true;
    }
    book.bids
        .iter()
        .chain(book.asks.iter())
        .any(|l| l.price <= 0.0 || l.price >= 1.0)
}

fn content_hash(market_id: &str, yes: &SideBook, no: &SideBook, changed_ms: i64) -> String {
    let mut s = format!("{market_id};{changed_ms};");
    for book in [yes, no] {
        for level in book.bids.iter().take(DEPTH_K) {
            s.push_str(&format!("b{}:{};", price_to_micros(level.price), level.size_usd as i64));
        }
        for level in book.asks.iter().take(DEPTH_K) {
            s.push_str(&format!("a{}:{};", price_to_micros(level.price), level.size_usd as i64));
        }
    }
    hex::encode(Sha256::digest(s.as_bytes()))
}

// ---------------------------------------------------------------------------
// Health predicates
// ---------------------------------------------------------------------------

/// Point-in-time view of the WS feed, owned by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct FeedStatus {
    pub connected: bool,
    pub current_epoch: u64,
    pub ws_last_message_ms: i64,
}

/// The shared WS health predicate. `bound_ms` is the only difference
/// between the decision (6 s) and execution (3 s) variants.
pub fn ws_healthy(
    market_id: &str,
    snap: &Snapshot,
    feed: FeedStatus,
    now_ms: i64,
    bound_ms: i64,
) -> bool {
    feed.connected
        && now_ms - feed.ws_last_message_ms <= GLOBAL_WS_STALE_MS
        && snap.source == SnapshotSource::Ws
        && snap.ws_epoch == feed.current_epoch
        && snap.market_id == market_id
        && snap.market_last_ws_update_ms > 0
        && now_ms - snap.market_last_ws_update_ms <= bound_ms
        && snap.orderbook_last_change_ms > 0
        && now_ms - snap.orderbook_last_change_ms <= bound_ms
        && snap.ws_last_message_ms >= snap.snapshot_at_ms
}

pub fn ws_healthy_decision(
    market_id: &str,
    snap: &Snapshot,
    feed: FeedStatus,
    now_ms: i64,
    bound_ms: i64,
) -> bool {
    ws_healthy(market_id, snap, feed, now_ms, bound_ms)
}

pub fn ws_healthy_exec(
    market_id: &str,
    snap: &Snapshot,
    feed: FeedStatus,
    now_ms: i64,
    bound_ms: i64,
) -> bool {
    ws_healthy(market_id, snap, feed, now_ms, bound_ms)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keeps the latest snapshot per market in memory and persists every insert
/// to the event store. Snapshots are append-only; readers take no locks
/// beyond the map read.
pub struct SnapshotStore {
    latest: RwLock<HashMap<String, Arc<Snapshot>>>,
    store: Option<EventStore>,
}

impl SnapshotStore {
    pub fn new(store: Option<EventStore>) -> Self {
        Self {
            latest: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Insert a new snapshot. Persistence failure degrades to a warning;
    /// the in-memory copy still serves decisions (the DB row is an audit
    /// artifact, not the health source).
    pub fn insert(&self, snap: Snapshot) -> Arc<Snapshot> {
        let snap = Arc::new(snap);

        if let Some(store) = &self.store {
            let persisted = store.with_conn(|conn| {
                let payload = serde_json::to_string(snap.as_ref())?;
                conn.execute(
                    "INSERT OR IGNORE INTO snapshots (id, market_id, recv_ms, content_hash, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        snap.id,
                        snap.market_id,
                        snap.snapshot_at_ms,
                        snap.content_hash,
                        payload
                    ],
                )?;
                Ok(())
            });
            if let Err(e) = persisted {
                warn!(market = %snap.market_id, error = %e, "snapshot persist failed");
            }
        }

        self.latest
            .write()
            .insert(snap.market_id.clone(), snap.clone());
        snap
    }

    pub fn latest(&self, market_id: &str) -> Option<Arc<Snapshot>> {
        self.latest.read().get(market_id).cloned()
    }

    pub fn markets(&self) -> Vec<String> {
        self.latest.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> BookLevel {
        BookLevel {
            price,
            size_usd: size,
        }
    }

    fn book(bid: f64, ask: f64) -> SideBook {
        SideBook {
            best_bid: Some(bid),
            best_ask: Some(ask),
            bids: vec![level(bid, 100.0)],
            asks: vec![level(ask, 100.0)],
        }
    }

    fn snap_with_asks(ask_yes: f64, ask_no: f64) -> Snapshot {
        Snapshot::new(
            "s1".into(),
            "mkt-1".into(),
            1_000,
            SnapshotSource::Ws,
            1,
            1_000,
            1_000,
            1_000,
            book(ask_yes - 0.01, ask_yes),
            book(ask_no - 0.01, ask_no),
        )
    }

    fn healthy_snap(now_ms: i64) -> Snapshot {
        Snapshot::new(
            "s1".into(),
            "mkt-1".into(),
            now_ms - 1_000,
            SnapshotSource::Ws,
            3,
            now_ms - 500,
            now_ms - 1_000,
            now_ms - 1_000,
            book(0.42, 0.44),
            book(0.55, 0.57),
        )
    }

    fn feed(now_ms: i64) -> FeedStatus {
        FeedStatus {
            connected: true,
            current_epoch: 3,
            ws_last_message_ms: now_ms - 500,
        }
    }

    #[test]
    fn ask_sum_boundaries() {
        // 0.979 -> anomaly; 0.98 exactly -> clean.
        assert!(snap_with_asks(0.50, 0.479).ask_sum_anomaly);
        assert!(!snap_with_asks(0.50, 0.48).ask_sum_anomaly);
        assert!(!snap_with_asks(0.999, 0.999).ask_sum_anomaly); // sum 1.998

        // A sum of exactly 2.00 is clean; 2.001 is an anomaly. Prices at or
        // above 1.0 also trip invalid_book, but the two flags are orthogonal.
        let s = snap_with_asks(0.999, 1.001); // sum 2.000
        assert!(!s.ask_sum_anomaly);
        let s = snap_with_asks(0.999, 1.002); // sum 2.001
        assert!(s.ask_sum_anomaly);
        assert!(s.invalid_book);
    }

    #[test]
    fn invalid_book_flags() {
        // bid > ask
        let s = Snapshot::new(
            "s".into(),
            "m".into(),
            0,
            SnapshotSource::Ws,
            0,
            0,
            0,
            0,
            book(0.50, 0.45),
            book(0.40, 0.41),
        );
        assert!(s.invalid_book);

        // missing best
        let missing = SideBook {
            best_bid: None,
            best_ask: Some(0.5),
            bids: vec![],
            asks: vec![level(0.5, 10.0)],
        };
        let s = Snapshot::new(
            "s".into(),
            "m".into(),
            0,
            SnapshotSource::Ws,
            0,
            0,
            0,
            0,
            missing,
            book(0.40, 0.41),
        );
        assert!(s.invalid_book);

        // price out of (0,1)
        let s = Snapshot::new(
            "s".into(),
            "m".into(),
            0,
            SnapshotSource::Ws,
            0,
            0,
            0,
            0,
            book(0.0, 0.41),
            book(0.40, 0.41),
        );
        assert!(s.invalid_book);
    }

    #[test]
    fn content_hash_is_deterministic_and_sensitive() {
        let a = snap_with_asks(0.50, 0.52);
        let b = snap_with_asks(0.50, 0.52);
        let c = snap_with_asks(0.50, 0.53);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn freshness_boundary_passes_decision_fails_exec() {
        let now_ms = 1_000_000;
        let mut snap = healthy_snap(now_ms);
        // Exactly at the 6 s decision bound.
        snap.market_last_ws_update_ms = now_ms - 6_000;
        snap.orderbook_last_change_ms = now_ms - 1_000;
        // Recompute is not needed; freshness fields are not hashed inputs here.
        assert!(ws_healthy_decision("mkt-1", &snap, feed(now_ms), now_ms, 6_000));
        assert!(!ws_healthy_exec("mkt-1", &snap, feed(now_ms), now_ms, 3_000));
    }

    #[test]
    fn stale_epoch_is_immediately_unhealthy() {
        let now_ms = 1_000_000;
        let snap = healthy_snap(now_ms);
        let mut f = feed(now_ms);
        f.current_epoch = 4; // disconnect happened after capture
        assert!(!ws_healthy_decision("mkt-1", &snap, f, now_ms, 6_000));
    }

    #[test]
    fn disconnected_or_globally_stale_feed_is_unhealthy() {
        let now_ms = 1_000_000;
        let snap = healthy_snap(now_ms);

        let mut f = feed(now_ms);
        f.connected = false;
        assert!(!ws_healthy_exec("mkt-1", &snap, f, now_ms, 3_000));

        let mut f = feed(now_ms);
        f.ws_last_message_ms = now_ms - 10_001;
        assert!(!ws_healthy_exec("mkt-1", &snap, f, now_ms, 3_000));
    }

    #[test]
    fn rest_snapshot_never_healthy() {
        let now_ms = 1_000_000;
        let mut snap = healthy_snap(now_ms);
        snap.source = SnapshotSource::Rest;
        assert!(!ws_healthy_decision("mkt-1", &snap, feed(now_ms), now_ms, 6_000));
    }

    #[test]
    fn market_mismatch_and_zero_timestamps_unhealthy() {
        let now_ms = 1_000_000;
        let snap = healthy_snap(now_ms);
        assert!(!ws_healthy_decision("other", &snap, feed(now_ms), now_ms, 6_000));

        let mut z = healthy_snap(now_ms);
        z.market_last_ws_update_ms = 0;
        assert!(!ws_healthy_decision("mkt-1", &z, feed(now_ms), now_ms, 6_000));
    }

    #[test]
    fn snapshot_message_ordering_required() {
        let now_ms = 1_000_000;
        let mut snap = healthy_snap(now_ms);
        // Snapshot claims to postdate the feed's last message.
        snap.ws_last_message_ms = snap.snapshot_at_ms - 1;
        assert!(!ws_healthy_decision("mkt-1", &snap, feed(now_ms), now_ms, 6_000));
    }

    #[test]
    fn store_keeps_latest_per_market() {
        let store = SnapshotStore::new(None);
        store.insert(healthy_snap(10_000));
        let mut newer = healthy_snap(20_000);
        newer.id = "s2".into();
        store.insert(newer);
        let latest = store.latest("mkt-1").unwrap();
        assert_eq!(latest.id, "s2");
        assert!(store.latest("unknown").is_none());
    }

    #[test]
    fn store_persists_to_event_store() {
        let es = EventStore::open_in_memory().unwrap();
        let store = SnapshotStore::new(Some(es.clone()));
        store.insert(healthy_snap(10_000));
        let n: i64 = es
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(n, 1);
    }
}
