// =============================================================================
// Event Store — transactional event log + signed singleton state row
// =============================================================================
//
// SQLite-backed persistence for everything durable except the WAL file:
// the signed bot_state singleton, the append-only event log (payload hash
// unique), orders, decisions, snapshots, mismatches, locks, AI budget rows,
// and arming nonces.
//
// A single writer connection behind a mutex; budget-day and bot_state rows
// are mutated only inside immediate (write-locking) transactions, which
// makes those mutations serializable by construction.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::types::{Order, OrderStatus, Side};

/// Shared handle to the event store. Clone freely; all clones share one
/// connection.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    // -------------------------------------------------------------------------
    // Construction & schema
    // -------------------------------------------------------------------------

    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("open event store")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory event store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL,
                counter INTEGER NOT NULL,
                ts_ms INTEGER NOT NULL,
                armed_until_ms INTEGER,
                halt_until_ms INTEGER,
                halt_resume_state TEXT,
                sig TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                kind TEXT NOT NULL,
                correlation_id TEXT,
                payload TEXT NOT NULL,
                payload_hash TEXT NOT NULL UNIQUE
            );
            CREATE INDEX IF NOT EXISTS idx_event_log_kind_ts ON event_log(kind, ts_ms);

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT,
                price_micros INTEGER NOT NULL,
                size_cents INTEGER NOT NULL,
                filled_cents INTEGER NOT NULL DEFAULT 0,
                residual_cents INTEGER NOT NULL DEFAULT 0,
                pending_unknown_since_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                paper INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_orders_active
                ON orders(market_id, status)
                WHERE status IN ('PENDING_SUBMIT','OPEN','PARTIALLY_FILLED',
                                 'CANCEL_REQUESTED','PENDING_UNKNOWN');

            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                side TEXT NOT NULL,
                snapshot_hash TEXT NOT NULL,
                price_micros INTEGER NOT NULL,
                size_cents INTEGER NOT NULL,
                p_market_micros INTEGER NOT NULL,
                p_eff_micros INTEGER NOT NULL,
                required_edge_micros INTEGER NOT NULL,
                ev_micros INTEGER NOT NULL,
                reason TEXT NOT NULL,
                gate_json TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                recv_ms INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_market_recv
                ON snapshots(market_id, recv_ms);

            CREATE TABLE IF NOT EXISTS market_locks (
                market_id TEXT PRIMARY KEY,
                owner_instance TEXT NOT NULL,
                owner_worker TEXT NOT NULL,
                lock_version INTEGER NOT NULL,
                owner_heartbeat_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                last_renewed_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reconcile_mismatches (
                id TEXT PRIMARY KEY,
                market_id TEXT,
                level INTEGER NOT NULL,
                status TEXT NOT NULL,
                first_seen_ms INTEGER NOT NULL,
                last_seen_ms INTEGER NOT NULL,
                details TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mismatches_status
                ON reconcile_mismatches(status, level);

            CREATE TABLE IF NOT EXISTS ai_budget_day (
                day TEXT PRIMARY KEY,
                spent_cents INTEGER NOT NULL DEFAULT 0,
                in_flight_cents INTEGER NOT NULL DEFAULT 0,
                force_settled_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS ai_reservations (
                id TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                ts_utc_db_ms INTEGER NOT NULL,
                model_key TEXT NOT NULL,
                reserved_cents INTEGER NOT NULL,
                actual_cents INTEGER,
                status TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_window
                ON ai_reservations(ts_utc_db_ms, status);
            CREATE INDEX IF NOT EXISTS idx_reservations_day
                ON ai_reservations(day, correlation_id);

            CREATE TABLE IF NOT EXISTS arming_nonces (
                nonce TEXT PRIMARY KEY,
                step INTEGER NOT NULL,
                issued_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                snapshot_id TEXT NOT NULL,
                status TEXT NOT NULL,
                state_version INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            );",
        )
        .context("event store schema init failed")?;

        info!("event store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Run `f` inside an immediate (write-locking) transaction. Commits on
    /// Ok, rolls back on Err. This is the serialization point for budget
    /// rows, bot_state, and lock rows.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate transaction")?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().context("commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                // Rollback happens on drop.
                Err(e)
            }
        }
    }

    /// Run a read-only closure against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // -------------------------------------------------------------------------
    // Event log
    // -------------------------------------------------------------------------

    /// Append an event. The payload hash is unique: re-appending an
    /// identical payload is a no-op and returns false.
    pub fn append_event(
        &self,
        kind: &str,
        correlation_id: Option<&str>,
        payload: &serde_json::Value,
        ts_ms: i64,
    ) -> Result<bool> {
        let body = serde_json::to_string(payload).context("serialise event payload")?;
        let hash = hex::encode(Sha256::digest(body.as_bytes()));

        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO event_log (ts_ms, kind, correlation_id, payload, payload_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts_ms, kind, correlation_id, body, hash],
            )
            .map_err(|e| crate::types::CoreError::PersistenceWrite(format!("event append: {e}")))?;

        if inserted == 0 {
            debug!(kind, "duplicate event payload ignored");
        }
        Ok(inserted > 0)
    }

    /// Count events of `kind` since `since_ms` (used by tests and status).
    pub fn count_events(&self, kind: &str, since_ms: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_log WHERE kind = ?1 AND ts_ms >= ?2",
                params![kind, since_ms],
                |row| row.get(0),
            )
            .context("count events")?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // bot_state raw row
    // -------------------------------------------------------------------------

    /// Read the raw signed state row, if present. Signature verification is
    /// the state machine's job.
    pub fn read_bot_state_row(&self) -> Result<Option<BotStateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT state, counter, ts_ms, armed_until_ms, halt_until_ms, halt_resume_state, sig
             FROM bot_state WHERE id = 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some(BotStateRow {
                state: row.get(0)?,
                counter: row.get(1)?,
                ts_ms: row.get(2)?,
                armed_until_ms: row.get(3)?,
                halt_until_ms: row.get(4)?,
                halt_resume_state: row.get(5)?,
                sig: row.get(6)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Persist the signed state row inside a write transaction.
    pub fn write_bot_state_row(&self, row: &BotStateRow) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO bot_state
                    (id, state, counter, ts_ms, armed_until_ms, halt_until_ms, halt_resume_state, sig)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    counter = excluded.counter,
                    ts_ms = excluded.ts_ms,
                    armed_until_ms = excluded.armed_until_ms,
                    halt_until_ms = excluded.halt_until_ms,
                    halt_resume_state = excluded.halt_resume_state,
                    sig = excluded.sig",
                params![
                    row.state,
                    row.counter,
                    row.ts_ms,
                    row.armed_until_ms,
                    row.halt_until_ms,
                    row.halt_resume_state,
                    row.sig
                ],
            )
            .context("write bot_state row")?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders
                (id, decision_id, market_id, side, status, client_order_id, exchange_order_id,
                 price_micros, size_cents, filled_cents, residual_cents,
                 pending_unknown_since_ms, created_at_ms, updated_at_ms, paper)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                exchange_order_id = excluded.exchange_order_id,
                filled_cents = excluded.filled_cents,
                residual_cents = excluded.residual_cents,
                pending_unknown_since_ms = excluded.pending_unknown_since_ms,
                updated_at_ms = excluded.updated_at_ms",
            params![
                order.id,
                order.decision_id,
                order.market_id,
                order.side.as_str(),
                order.status.as_str(),
                order.client_order_id,
                order.exchange_order_id,
                order.price_micros,
                order.size_cents,
                order.filled_cents,
                order.residual_cents,
                order.pending_unknown_since_ms,
                order.created_at_ms,
                order.updated_at_ms,
                order.paper as i64
            ],
        )
        .context("upsert order")?;
        Ok(())
    }

    pub fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, decision_id, market_id, side, status, client_order_id,
                    exchange_order_id, price_micros, size_cents, filled_cents,
                    residual_cents, pending_unknown_since_ms, created_at_ms,
                    updated_at_ms, paper
             FROM orders WHERE client_order_id = ?1",
        )?;
        let mut rows = stmt.query(params![client_order_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::order_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All orders whose status still represents live exposure.
    pub fn active_orders(&self) -> Result<Vec<Order>> {
        self.orders_where(
            "status IN ('PENDING_SUBMIT','OPEN','PARTIALLY_FILLED','CANCEL_REQUESTED','PENDING_UNKNOWN')",
        )
    }

    pub fn pending_unknown_orders(&self) -> Result<Vec<Order>> {
        self.orders_where("status = 'PENDING_UNKNOWN'")
    }

    pub fn pending_unknown_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status = 'PENDING_UNKNOWN'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn pending_unknown_in_market(&self, market_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status = 'PENDING_UNKNOWN' AND market_id = ?1",
            params![market_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// True if a successful LIVE submit was already recorded for this
    /// client_order_id — the idempotency barrier for duplicate submits.
    pub fn live_submit_recorded(&self, client_order_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE client_order_id = ?1 AND paper = 0",
            params![client_order_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn orders_where(&self, predicate: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, decision_id, market_id, side, status, client_order_id,
                    exchange_order_id, price_micros, size_cents, filled_cents,
                    residual_cents, pending_unknown_since_ms, created_at_ms,
                    updated_at_ms, paper
             FROM orders WHERE {predicate} ORDER BY created_at_ms"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::order_from_row(row)?);
        }
        Ok(out)
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> Result<Order> {
        let side: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(Order {
            id: row.get(0)?,
            decision_id: row.get(1)?,
            market_id: row.get(2)?,
            side: Side::from_str_opt(&side)
                .with_context(|| format!("unknown side in orders row: {side}"))?,
            status: OrderStatus::from_str_opt(&status)
                .with_context(|| format!("unknown status in orders row: {status}"))?,
            client_order_id: row.get(5)?,
            exchange_order_id: row.get(6)?,
            price_micros: row.get(7)?,
            size_cents: row.get(8)?,
            filled_cents: row.get(9)?,
            residual_cents: row.get(10)?,
            pending_unknown_since_ms: row.get(11)?,
            created_at_ms: row.get(12)?,
            updated_at_ms: row.get(13)?,
            paper: row.get::<_, i64>(14)? != 0,
        })
    }

    // -------------------------------------------------------------------------
    // Decisions & candidates
    // -------------------------------------------------------------------------

    /// Persist a decision. Decisions are immutable once written: re-inserts
    /// of the same id are ignored.
    pub fn insert_decision(&self, decision: &crate::decision::Decision) -> Result<()> {
        use crate::types::price_to_micros;

        let gate_json = serde_json::to_string(&serde_json::json!({
            "friction": decision.friction,
            "marketable_limit": decision.marketable_limit,
        }))
        .context("serialise decision gate snapshot")?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO decisions
                (id, market_id, side, snapshot_hash, price_micros, size_cents,
                 p_market_micros, p_eff_micros, required_edge_micros, ev_micros,
                 reason, gate_json, client_order_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                decision.id,
                decision.market_id,
                decision.side.as_str(),
                decision.snapshot_hash,
                price_to_micros(decision.price),
                decision.size_cents,
                price_to_micros(decision.p_market),
                price_to_micros(decision.p_eff),
                price_to_micros(decision.required_edge),
                price_to_micros(decision.ev),
                "TRADE",
                gate_json,
                decision.client_order_id,
                decision.created_at_ms
            ],
        )
        .context("insert decision")?;
        Ok(())
    }

    /// Persist a candidate's latest status and version.
    pub fn upsert_candidate(&self, candidate: &crate::types::Candidate) -> Result<()> {
        let payload =
            serde_json::to_string(candidate).context("serialise candidate payload")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO candidates
                (id, market_id, snapshot_id, status, state_version, created_at_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                state_version = excluded.state_version,
                payload = excluded.payload",
            params![
                candidate.id,
                candidate.market_id,
                candidate.snapshot_id,
                candidate.status.as_str(),
                candidate.state_version as i64,
                candidate.created_at_ms,
                payload
            ],
        )
        .context("upsert candidate")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Arming nonces
    // -------------------------------------------------------------------------

    pub fn insert_nonce(&self, nonce: &str, step: u8, now_ms: i64, ttl_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arming_nonces (nonce, step, issued_at_ms, expires_at_ms, consumed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![nonce, step as i64, now_ms, now_ms + ttl_ms],
        )
        .context("insert arming nonce")?;
        Ok(())
    }

    /// Read-only check that a nonce exists for `step`, is unconsumed, and
    /// has not expired. Consumption stays a separate CAS so validation can
    /// run without burning the nonce.
    pub fn nonce_usable(&self, nonce: &str, step: u8, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM arming_nonces
             WHERE nonce = ?1 AND step = ?2 AND consumed = 0 AND expires_at_ms >= ?3",
            params![nonce, step as i64, now_ms],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Atomically consume a nonce: succeeds only when it exists, matches
    /// the step, is unconsumed, and has not expired.
    pub fn consume_nonce(&self, nonce: &str, step: u8, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE arming_nonces SET consumed = 1
             WHERE nonce = ?1 AND step = ?2 AND consumed = 0 AND expires_at_ms >= ?3",
            params![nonce, step as i64, now_ms],
        )?;
        Ok(updated > 0)
    }

    /// Invalidate every outstanding nonce (startup step 7).
    pub fn invalidate_all_nonces(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE arming_nonces SET consumed = 1 WHERE consumed = 0", [])
            .context("invalidate arming nonces")?;
        Ok(())
    }
}

/// Raw persisted bot_state row; fields are signed by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct BotStateRow {
    pub state: String,
    pub counter: i64,
    pub ts_ms: i64,
    pub armed_until_ms: Option<i64>,
    pub halt_until_ms: Option<i64>,
    pub halt_resume_state: Option<String>,
    pub sig: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(client_id: &str, status: OrderStatus) -> Order {
        Order {
            id: format!("ord-{client_id}"),
            decision_id: format!("dec-{client_id}"),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status,
            client_order_id: client_id.into(),
            exchange_order_id: None,
            price_micros: 430_000,
            size_cents: 2_500,
            filled_cents: 0,
            residual_cents: 2_500,
            pending_unknown_since_ms: None,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
            paper: false,
        }
    }

    #[test]
    fn event_payload_hash_is_unique() {
        let store = EventStore::open_in_memory().unwrap();
        let payload = serde_json::json!({ "kind": "ORDER_RESULT", "client_order_id": "abc" });
        assert!(store.append_event("ORDER_RESULT", None, &payload, 1).unwrap());
        // Identical payload: ignored.
        assert!(!store.append_event("ORDER_RESULT", None, &payload, 2).unwrap());
        assert_eq!(store.count_events("ORDER_RESULT", 0).unwrap(), 1);
    }

    #[test]
    fn bot_state_row_roundtrip() {
        let store = EventStore::open_in_memory().unwrap();
        assert!(store.read_bot_state_row().unwrap().is_none());

        let row = BotStateRow {
            state: "OBSERVE_ONLY".into(),
            counter: 7,
            ts_ms: 123,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
            sig: "deadbeef".into(),
        };
        store.write_bot_state_row(&row).unwrap();
        assert_eq!(store.read_bot_state_row().unwrap(), Some(row.clone()));

        // Overwrite bumps in place: still a single row.
        let row2 = BotStateRow { counter: 8, ..row };
        store.write_bot_state_row(&row2).unwrap();
        assert_eq!(store.read_bot_state_row().unwrap().unwrap().counter, 8);
    }

    #[test]
    fn order_upsert_and_queries() {
        let store = EventStore::open_in_memory().unwrap();
        store.upsert_order(&order("a", OrderStatus::Open)).unwrap();
        store
            .upsert_order(&order("b", OrderStatus::PendingUnknown))
            .unwrap();
        store
            .upsert_order(&order("c", OrderStatus::Cancelled))
            .unwrap();

        assert_eq!(store.active_orders().unwrap().len(), 2);
        assert_eq!(store.pending_unknown_count().unwrap(), 1);
        assert!(store.pending_unknown_in_market("mkt-1").unwrap());
        assert!(!store.pending_unknown_in_market("mkt-2").unwrap());

        let fetched = store.get_order_by_client_id("b").unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::PendingUnknown);

        // Status update through upsert.
        let mut b = order("b", OrderStatus::Cancelled);
        b.updated_at_ms = 2_000;
        store.upsert_order(&b).unwrap();
        assert_eq!(store.pending_unknown_count().unwrap(), 0);
    }

    #[test]
    fn live_submit_idempotency_barrier() {
        let store = EventStore::open_in_memory().unwrap();
        assert!(!store.live_submit_recorded("a").unwrap());
        store.upsert_order(&order("a", OrderStatus::Open)).unwrap();
        assert!(store.live_submit_recorded("a").unwrap());
    }

    #[test]
    fn decisions_are_write_once() {
        let store = EventStore::open_in_memory().unwrap();
        let decision = crate::decision::Decision {
            id: "a".repeat(64),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            snapshot_hash: "h".into(),
            price: 0.43,
            size_cents: 2_000,
            p_market: 0.44,
            p_eff: 0.47,
            required_edge: 0.02,
            ev: 0.01,
            friction: crate::decision::Friction {
                spread_cost: 0.01,
                fee_cost: 0.002,
                slippage: 0.005,
                dispute: 0.01,
                latency: 0.0,
                time_value: 0.001,
            },
            marketable_limit: false,
            client_order_id: "a".repeat(16),
            created_at_ms: 1_000,
        };
        store.insert_decision(&decision).unwrap();
        // Re-insert with mutated fields is ignored: the row is immutable.
        let mutated = crate::decision::Decision {
            size_cents: 9_999,
            ..decision.clone()
        };
        store.insert_decision(&mutated).unwrap();

        let size: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT size_cents FROM decisions WHERE id = ?1",
                    params![decision.id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(size, 2_000);
    }

    #[test]
    fn candidate_upsert_tracks_status() {
        let store = EventStore::open_in_memory().unwrap();
        let mut candidate = crate::types::Candidate {
            id: "cand-1".into(),
            market_id: "mkt-1".into(),
            snapshot_id: "snap-1".into(),
            snapshot_hash: "h".into(),
            created_at_ms: 1_000,
            trigger_reasons: vec!["BOOK_CHANGED".into()],
            status: crate::types::CandidateStatus::New,
            state_version: 0,
        };
        store.upsert_candidate(&candidate).unwrap();
        candidate.advance(crate::types::CandidateStatus::Decided);
        store.upsert_candidate(&candidate).unwrap();

        let (status, version): (String, i64) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT status, state_version FROM candidates WHERE id = 'cand-1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(status, "DECIDED");
        assert_eq!(version, 1);
    }

    #[test]
    fn nonce_consume_is_single_use() {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_nonce("n1", 1, 1_000, 120_000).unwrap();

        // Usability is a read-only probe: it does not burn the nonce.
        assert!(store.nonce_usable("n1", 1, 2_000).unwrap());
        assert!(store.nonce_usable("n1", 1, 2_000).unwrap());
        assert!(!store.nonce_usable("n1", 2, 2_000).unwrap());
        assert!(!store.nonce_usable("n1", 1, 1_000 + 120_001).unwrap());

        assert!(store.consume_nonce("n1", 1, 2_000).unwrap());
        // Second consume fails, and the nonce is no longer usable.
        assert!(!store.consume_nonce("n1", 1, 2_000).unwrap());
        assert!(!store.nonce_usable("n1", 1, 2_000).unwrap());
        // Wrong step fails.
        store.insert_nonce("n2", 2, 1_000, 120_000).unwrap();
        assert!(!store.consume_nonce("n2", 1, 2_000).unwrap());
        // Expired fails.
        store.insert_nonce("n3", 1, 1_000, 120_000).unwrap();
        assert!(!store.consume_nonce("n3", 1, 1_000 + 120_001).unwrap());
    }

    #[test]
    fn invalidate_all_nonces_consumes_everything() {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_nonce("n1", 1, 1_000, 120_000).unwrap();
        store.insert_nonce("n2", 2, 1_000, 120_000).unwrap();
        store.invalidate_all_nonces().unwrap();
        assert!(!store.consume_nonce("n1", 1, 2_000).unwrap());
        assert!(!store.consume_nonce("n2", 2, 2_000).unwrap());
    }
}
