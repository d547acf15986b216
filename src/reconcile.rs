// =============================================================================
// Reconciliation Engine — venue truth vs local state, RECONCILE_GREEN
// =============================================================================
//
// REST reads (open orders, positions, balance) are authoritative for
// reconciliation only; reconciliation never creates exposure. Every drift
// becomes a Mismatch row levelled by USD delta against the wallet
// reference. RECONCILE_GREEN is the conjunctive predicate gating every new
// LIVE submit: recent completion, completion after the last WS activity,
// no ACTIVE Level-2/3 mismatches, zero PENDING_UNKNOWN orders, barrier
// down, WS up.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::event_store::EventStore;
use crate::types::{Blocker, Cents};
use crate::venue::VenueClient;

/// RECONCILE_GREEN freshness bound on the last completed cycle.
const GREEN_MAX_AGE_MS: i64 = 120_000;
/// Level thresholds: max(0.1% of wallet, floor).
const LEVEL2_FLOOR_CENTS: Cents = 100;
const LEVEL3_FLOOR_CENTS: Cents = 500;
/// Cumulative Level-1 drift per day that escalates to Level-2.
const L1_DAILY_ESCALATION_CENTS: Cents = 300;

// ---------------------------------------------------------------------------
// Mismatch levels
// ---------------------------------------------------------------------------

/// Level a drift of `delta_cents` against the wallet reference.
pub fn mismatch_level(delta_cents: Cents, wallet_cents: Cents) -> u8 {
    let scaled = wallet_cents / 1_000; // 0.1%
    let l2 = scaled.max(LEVEL2_FLOOR_CENTS);
    let l3 = scaled.max(LEVEL3_FLOOR_CENTS);
    if delta_cents >= l3 {
        3
    } else if delta_cents >= l2 {
        2
    } else {
        1
    }
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub orders_matched: u32,
    pub mismatches_found: u32,
    pub mismatches_resolved: u32,
    pub l1_escalated: bool,
    pub venue_balance_cents: Option<Cents>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ReconcileEngine {
    store: EventStore,
    venue: Arc<dyn VenueClient>,
    /// Cumulative Level-1 drift per UTC day.
    l1_drift: Mutex<HashMap<String, Cents>>,
}

impl ReconcileEngine {
    pub fn new(store: EventStore, venue: Arc<dyn VenueClient>) -> Self {
        Self {
            store,
            venue,
            l1_drift: Mutex::new(HashMap::new()),
        }
    }

    /// Run one full reconciliation cycle. On success the caller records the
    /// completion time on the coordinator.
    pub async fn run_cycle(&self, wallet_cents: Cents, now_ms: i64) -> Result<ReconcileReport> {
        debug!("reconciliation cycle started");

        let venue_orders = self
            .venue
            .open_orders()
            .await
            .context("reconcile: failed to fetch open orders")?;
        let venue_balance = self
            .venue
            .balance_cents()
            .await
            .context("reconcile: failed to fetch balance")?;

        let venue_by_client: HashMap<&str, &crate::venue::VenueOrder> = venue_orders
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();

        let local_active = self.store.active_orders()?;
        let mut report = ReconcileReport {
            venue_balance_cents: Some(venue_balance),
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::new();

        // ── Local vs venue ──────────────────────────────────────────────
        for order in local_active.iter().filter(|o| !o.paper) {
            use crate::types::OrderStatus;
            if order.status == OrderStatus::PendingUnknown {
                // Owned by the PENDING_UNKNOWN resolution loop (in-flight
                // submits) or the startup/heartbeat sweep; not flagged here.
                continue;
            }

            match venue_by_client.get(order.client_order_id.as_str()) {
                None => {
                    let id = format!("order-missing:{}", order.client_order_id);
                    let level = mismatch_level(order.residual_cents, wallet_cents);
                    self.upsert_mismatch(
                        &id,
                        Some(&order.market_id),
                        level,
                        &format!(
                            "local {} order has no venue record (residual {}c)",
                            order.status, order.residual_cents
                        ),
                        now_ms,
                    )?;
                    seen.insert(id);
                    report.mismatches_found += 1;
                }
                Some(venue_order) => {
                    let mut drift = Vec::new();
                    if venue_order.side != order.side {
                        drift.push("side");
                    }
                    if venue_order.size_cents != order.size_cents {
                        drift.push("size");
                    }
                    let venue_price_micros = crate::types::price_to_micros(venue_order.price);
                    if venue_price_micros != order.price_micros {
                        drift.push("price");
                    }

                    if drift.is_empty() {
                        report.orders_matched += 1;
                    } else {
                        let id = format!("order-drift:{}", order.client_order_id);
                        let delta =
                            (venue_order.size_cents - order.size_cents).abs().max(1);
                        let level = mismatch_level(delta, wallet_cents);
                        self.upsert_mismatch(
                            &id,
                            Some(&order.market_id),
                            level,
                            &format!("fields drifted: {}", drift.join(",")),
                            now_ms,
                        )?;
                        seen.insert(id);
                        report.mismatches_found += 1;
                    }
                }
            }
        }

        // ── Venue orders unknown locally ────────────────────────────────
        let local_by_client: HashSet<&str> = local_active
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();
        for venue_order in &venue_orders {
            if !local_by_client.contains(venue_order.client_order_id.as_str()) {
                let id = format!("order-unknown:{}", venue_order.client_order_id);
                let level = mismatch_level(venue_order.size_cents, wallet_cents);
                self.upsert_mismatch(
                    &id,
                    Some(&venue_order.market_id),
                    level,
                    "venue order with no local record",
                    now_ms,
                )?;
                seen.insert(id);
                report.mismatches_found += 1;
                warn!(
                    client_order_id = %venue_order.client_order_id,
                    "orphan venue order detected"
                );
            }
        }

        // ── Balance drift ───────────────────────────────────────────────
        let balance_delta = (venue_balance - wallet_cents).abs();
        if balance_delta > 0 {
            let level = mismatch_level(balance_delta, wallet_cents);
            if level == 1 {
                // Level-1 drift accumulates per day; past the daily cap it
                // escalates to Level-2 with an alert.
                let day = crate::budget::day_bucket(now_ms);
                let mut drift_map = self.l1_drift.lock();
                let total = drift_map.entry(day).or_insert(0);
                *total += balance_delta;
                if *total > L1_DAILY_ESCALATION_CENTS {
                    let id = "balance-drift-cumulative";
                    self.upsert_mismatch(
                        id,
                        None,
                        2,
                        &format!("cumulative level-1 drift {}c today", *total),
                        now_ms,
                    )?;
                    seen.insert(id.to_string());
                    report.mismatches_found += 1;
                    report.l1_escalated = true;
                }
            } else {
                let id = "balance-drift";
                self.upsert_mismatch(
                    id,
                    None,
                    level,
                    &format!("balance delta {}c", balance_delta),
                    now_ms,
                )?;
                seen.insert(id.to_string());
                report.mismatches_found += 1;
            }
        }

        // ── Resolution ──────────────────────────────────────────────────
        // A mismatch resolves only when a full cycle finds its entity
        // exactly equal again: i.e. it was not re-observed above.
        report.mismatches_resolved = self.resolve_unseen(&seen, now_ms)?;

        info!(
            matched = report.orders_matched,
            found = report.mismatches_found,
            resolved = report.mismatches_resolved,
            "reconciliation cycle completed"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Mismatch persistence
    // -------------------------------------------------------------------------

    fn upsert_mismatch(
        &self,
        id: &str,
        market_id: Option<&str>,
        level: u8,
        details: &str,
        now_ms: i64,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reconcile_mismatches
                    (id, market_id, level, status, first_seen_ms, last_seen_ms, details)
                 VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    level = MAX(level, excluded.level),
                    status = 'ACTIVE',
                    last_seen_ms = excluded.last_seen_ms,
                    details = excluded.details",
                params![id, market_id, level as i64, now_ms, details],
            )?;
            Ok(())
        })
    }

    fn resolve_unseen(&self, seen: &HashSet<String>, now_ms: i64) -> Result<u32> {
        let active: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT id FROM reconcile_mismatches WHERE status = 'ACTIVE'")?;
            let mut rows = stmt.query([])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get::<_, String>(0)?);
            }
            Ok(ids)
        })?;

        let mut resolved = 0;
        for id in active {
            if !seen.contains(&id) {
                self.store.with_conn(|conn| {
                    conn.execute(
                        "UPDATE reconcile_mismatches SET status = 'RESOLVED', last_seen_ms = ?2
                         WHERE id = ?1",
                        params![id, now_ms],
                    )?;
                    Ok(())
                })?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    pub fn active_l2_l3_count(&self) -> Result<i64> {
        active_l2_l3_count(&self.store)
    }
}

/// ACTIVE mismatches at Level 2 or 3.
pub fn active_l2_l3_count(store: &EventStore) -> Result<i64> {
    store.with_conn(|conn| {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reconcile_mismatches WHERE status = 'ACTIVE' AND level >= 2",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    })
}

// ---------------------------------------------------------------------------
// RECONCILE_GREEN
// ---------------------------------------------------------------------------

/// The predicate gating every new LIVE exposure.
pub fn reconcile_green(store: &EventStore, app: &AppState, now_ms: i64) -> Result<bool> {
    let last = app.last_reconcile_completed_ms();
    if last == 0 || now_ms - last > GREEN_MAX_AGE_MS {
        return Ok(false);
    }
    // Reconciliation must postdate the last WS activity.
    if last < app.feed_status().ws_last_message_ms {
        return Ok(false);
    }
    if active_l2_l3_count(store)? > 0 {
        return Ok(false);
    }
    if store.pending_unknown_count()? > 0 {
        return Ok(false);
    }
    if app.barrier_active() {
        return Ok(false);
    }
    if app.blocker_set(Blocker::WsDown) {
        return Ok(false);
    }
    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Manifest, RuntimeConfig};
    use crate::types::{Order, OrderStatus, Side};
    use crate::venue::testkit::ScriptedVenue;
    use crate::venue::VenueOrder;
    use std::collections::BTreeMap;

    const WALLET: Cents = 100_000; // $1000: L2 = 100c floor vs 100c scaled, L3 = 500c

    fn local_order(client_id: &str, status: OrderStatus, residual: Cents) -> Order {
        Order {
            id: format!("ord-{client_id}"),
            decision_id: format!("dec-{client_id}"),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status,
            client_order_id: client_id.into(),
            exchange_order_id: Some(format!("x-{client_id}")),
            price_micros: 430_000,
            size_cents: residual,
            filled_cents: 0,
            residual_cents: residual,
            pending_unknown_since_ms: None,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
            paper: false,
        }
    }

    fn venue_order(client_id: &str, size: Cents) -> VenueOrder {
        VenueOrder {
            client_order_id: client_id.into(),
            exchange_order_id: format!("x-{client_id}"),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            price: 0.43,
            size_cents: size,
            filled_cents: 0,
            status: "OPEN".into(),
        }
    }

    fn engine() -> (ReconcileEngine, EventStore, Arc<ScriptedVenue>) {
        let store = EventStore::open_in_memory().unwrap();
        let venue = Arc::new(ScriptedVenue::new());
        *venue.balance.lock() = WALLET;
        let engine = ReconcileEngine::new(store.clone(), venue.clone());
        (engine, store, venue)
    }

    fn app() -> AppState {
        let manifest = Manifest {
            artifacts: BTreeMap::new(),
            client_order_id_max_len: 32,
            venue_tick: 0.001,
            taker_vol_sigma_max: 0.004,
            model_worst_case_cents: BTreeMap::new(),
            operator_allowlist: vec![],
            sig: String::new(),
        };
        AppState::new(RuntimeConfig::default(), manifest)
    }

    #[test]
    fn level_thresholds_scale_with_wallet() {
        // $1000 wallet: 0.1% = 100c, floors 100c/500c.
        assert_eq!(mismatch_level(99, WALLET), 1);
        assert_eq!(mismatch_level(100, WALLET), 2);
        assert_eq!(mismatch_level(499, WALLET), 2);
        assert_eq!(mismatch_level(500, WALLET), 3);

        // Tiny wallet: floors bind.
        assert_eq!(mismatch_level(99, 1_000), 1);
        assert_eq!(mismatch_level(100, 1_000), 2);
        assert_eq!(mismatch_level(500, 1_000), 3);

        // Huge wallet: 0.1% dominates both floors, so level 2 never
        // appears below it.
        assert_eq!(mismatch_level(5_000, 10_000_000), 1);
        assert_eq!(mismatch_level(10_000, 10_000_000), 3);
    }

    #[tokio::test]
    async fn matching_orders_produce_no_mismatch() {
        let (engine, store, venue) = engine();
        store
            .upsert_order(&local_order("a", OrderStatus::Open, 2_000))
            .unwrap();
        venue.add_open_order(venue_order("a", 2_000));

        let report = engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert_eq!(report.orders_matched, 1);
        assert_eq!(report.mismatches_found, 0);
        assert_eq!(engine.active_l2_l3_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_venue_order_raises_levelled_mismatch() {
        let (engine, store, _venue) = engine();
        store
            .upsert_order(&local_order("a", OrderStatus::Open, 600))
            .unwrap();

        let report = engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert_eq!(report.mismatches_found, 1);
        // 600c >= L3 (500c).
        assert_eq!(engine.active_l2_l3_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn mismatch_resolves_after_clean_cycle() {
        let (engine, store, venue) = engine();
        store
            .upsert_order(&local_order("a", OrderStatus::Open, 600))
            .unwrap();

        engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert_eq!(engine.active_l2_l3_count().unwrap(), 1);

        // Venue catches up; the next full cycle finds exact equality.
        venue.add_open_order(venue_order("a", 600));
        let report = engine.run_cycle(WALLET, 2_000).await.unwrap();
        assert_eq!(report.orders_matched, 1);
        assert_eq!(report.mismatches_resolved, 1);
        assert_eq!(engine.active_l2_l3_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_venue_order_is_flagged() {
        let (engine, _store, venue) = engine();
        venue.add_open_order(venue_order("ghost", 1_000));

        let report = engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert_eq!(report.mismatches_found, 1);
        assert_eq!(engine.active_l2_l3_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cumulative_l1_drift_escalates() {
        let (engine, _store, venue) = engine();
        // 90c drift per cycle: level 1 each time, cumulative 360c > 300c.
        *venue.balance.lock() = WALLET + 90;

        let r1 = engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert!(!r1.l1_escalated);
        let r2 = engine.run_cycle(WALLET, 2_000).await.unwrap();
        assert!(!r2.l1_escalated);
        let r3 = engine.run_cycle(WALLET, 3_000).await.unwrap();
        assert!(!r3.l1_escalated);
        let r4 = engine.run_cycle(WALLET, 4_000).await.unwrap();
        assert!(r4.l1_escalated);
        assert_eq!(engine.active_l2_l3_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn paper_orders_are_ignored() {
        let (engine, store, _venue) = engine();
        let mut paper = local_order("p", OrderStatus::Open, 600);
        paper.paper = true;
        store.upsert_order(&paper).unwrap();

        let report = engine.run_cycle(WALLET, 1_000).await.unwrap();
        assert_eq!(report.mismatches_found, 0);
    }

    #[test]
    fn green_requires_every_condition() {
        let store = EventStore::open_in_memory().unwrap();
        let app = app();
        let now = 1_000_000;

        // No completed reconcile yet.
        assert!(!reconcile_green(&store, &app, now).unwrap());

        app.ws_note_message(now - 5_000);
        app.note_reconcile_completed(now - 1_000);
        assert!(reconcile_green(&store, &app, now).unwrap());

        // Too old.
        assert!(!reconcile_green(&store, &app, now + GREEN_MAX_AGE_MS).unwrap());

        // WS activity after the reconcile.
        app.ws_note_message(now - 500);
        assert!(!reconcile_green(&store, &app, now).unwrap());
        app.note_reconcile_completed(now - 100);
        assert!(reconcile_green(&store, &app, now).unwrap());

        // Barrier.
        app.raise_barrier();
        assert!(!reconcile_green(&store, &app, now).unwrap());
        app.lower_barrier();

        // WS_DOWN blocker.
        app.set_blocker(Blocker::WsDown);
        assert!(!reconcile_green(&store, &app, now).unwrap());
        app.clear_blocker(Blocker::WsDown);
        assert!(reconcile_green(&store, &app, now).unwrap());
    }

    #[test]
    fn pending_unknown_blocks_green() {
        let store = EventStore::open_in_memory().unwrap();
        let app = app();
        let now = 1_000_000;
        app.ws_note_message(now - 5_000);
        app.note_reconcile_completed(now - 1_000);
        assert!(reconcile_green(&store, &app, now).unwrap());

        store
            .upsert_order(&local_order("pu", OrderStatus::PendingUnknown, 100))
            .unwrap();
        assert!(!reconcile_green(&store, &app, now).unwrap());
    }

    #[test]
    fn active_l2_blocks_green() {
        let store = EventStore::open_in_memory().unwrap();
        let app = app();
        let now = 1_000_000;
        app.ws_note_message(now - 5_000);
        app.note_reconcile_completed(now - 1_000);

        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO reconcile_mismatches
                        (id, market_id, level, status, first_seen_ms, last_seen_ms, details)
                     VALUES ('m1', 'mkt-1', 2, 'ACTIVE', 0, 0, 'test')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(!reconcile_green(&store, &app, now).unwrap());
    }
}
