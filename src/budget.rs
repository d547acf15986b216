// =============================================================================
// AI Budget Manager — atomic reservations, idempotent settlement, reaper
// =============================================================================
//
// Every AI call reserves its pinned worst-case cost before the request goes
// out, settles with the actual cost afterwards, and is force-settled by the
// reaper if the caller dies. All mutations run inside immediate
// transactions against the day row, which serializes concurrent reservers.
//
// Caps: daily = min($2.00, 0.5% of the wallet reference); a rolling 600 s
// window capped at 20% of daily; at most 100 analyses (distinct correlation
// ids) per UTC day. RESERVED rows inside the window already embody the
// in-flight total, so the window check counts rows only — in_flight is
// checked against the daily cap.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::params;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_store::EventStore;
use crate::types::Cents;

/// Reservation lifetime before the reaper may claim it.
pub const RESERVATION_TTL_MS: i64 = 120_000;
/// Rolling window length.
pub const WINDOW_MS: i64 = 600_000;
/// Forward slop on the window to absorb clock jitter between writers.
pub const WINDOW_FUTURE_SLOP_MS: i64 = 5_000;
/// Reaper only claims reservations this far past expiry.
pub const REAPER_GRACE_MS: i64 = 5_000;
/// Hard cap on analyses per UTC day.
pub const MAX_ANALYSES_PER_DAY: i64 = 100;
/// Force-settle count that degrades cost accounting in LIVE.
pub const FORCE_SETTLE_DEGRADE_THRESHOLD: i64 = 3;

/// Absolute daily ceiling in cents.
const DAILY_CAP_CEILING_CENTS: Cents = 200;
/// Daily cap as a fraction of the wallet reference.
const DAILY_CAP_WALLET_FRACTION: f64 = 0.005;
/// Window cap as a fraction of the daily cap.
const WINDOW_CAP_FRACTION: f64 = 0.20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Reserved,
    Settled,
    ForceSettled,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Settled => "SETTLED",
            Self::ForceSettled => "FORCE_SETTLED",
            Self::Released => "RELEASED",
        }
    }
}

/// A granted reservation.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub day: String,
    pub ts_utc_db_ms: i64,
    pub model_key: String,
    pub reserved_cents: Cents,
    pub status: ReservationStatus,
    pub correlation_id: String,
    pub expires_at_ms: i64,
}

/// Outcome of a reservation attempt. Denials carry the specific limit hit.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Denied(&'static str),
}

/// Effective caps derived from the wallet reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCaps {
    pub daily_cents: Cents,
    pub window_cents: Cents,
}

/// Compute effective caps for a wallet reference.
pub fn caps_for_wallet(wallet_cents: Cents) -> BudgetCaps {
    let wallet_scaled = (wallet_cents as f64 * DAILY_CAP_WALLET_FRACTION).floor() as Cents;
    let daily = DAILY_CAP_CEILING_CENTS.min(wallet_scaled).max(0);
    BudgetCaps {
        daily_cents: daily,
        window_cents: (daily as f64 * WINDOW_CAP_FRACTION).floor() as Cents,
    }
}

/// UTC calendar day bucket for a db-anchored timestamp.
pub fn day_bucket(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct BudgetManager {
    store: EventStore,
}

impl BudgetManager {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Reserve `worst_case_cents` for one model call. All checks and the
    /// insert happen in a single write transaction on the day row.
    pub fn reserve(
        &self,
        model_key: &str,
        worst_case_cents: Cents,
        correlation_id: &str,
        caps: BudgetCaps,
        now_ms: i64,
    ) -> Result<ReserveOutcome> {
        if worst_case_cents <= 0 {
            return Err(
                crate::types::CoreError::Validation("worst_case_cents must be positive".into())
                    .into(),
            );
        }

        let day = day_bucket(now_ms);
        let model_key = model_key.to_string();
        let correlation_id = correlation_id.to_string();

        self.store.with_tx(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO ai_budget_day (day, spent_cents, in_flight_cents, force_settled_count)
                 VALUES (?1, 0, 0, 0)",
                params![day],
            )?;

            let (spent, in_flight): (Cents, Cents) = tx.query_row(
                "SELECT spent_cents, in_flight_cents FROM ai_budget_day WHERE day = ?1",
                params![day],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            // Rolling-window sum over live and settled reservations.
            let window_sum: Cents = tx.query_row(
                "SELECT COALESCE(SUM(COALESCE(actual_cents, reserved_cents)), 0)
                 FROM ai_reservations
                 WHERE ts_utc_db_ms >= ?1 AND ts_utc_db_ms <= ?2
                   AND status IN ('RESERVED','SETTLED','FORCE_SETTLED')",
                params![now_ms - WINDOW_MS, now_ms + WINDOW_FUTURE_SLOP_MS],
                |row| row.get(0),
            )?;

            let analyses: i64 = tx.query_row(
                "SELECT COUNT(DISTINCT correlation_id) FROM ai_reservations WHERE day = ?1",
                params![day],
                |row| row.get(0),
            )?;

            let new_analysis: bool = {
                let existing: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM ai_reservations WHERE day = ?1 AND correlation_id = ?2",
                    params![day, correlation_id],
                    |row| row.get(0),
                )?;
                existing == 0
            };

            if spent + in_flight + worst_case_cents > caps.daily_cents {
                return Ok(ReserveOutcome::Denied("DAILY_CAP"));
            }
            if window_sum + worst_case_cents > caps.window_cents {
                return Ok(ReserveOutcome::Denied("WINDOW_CAP"));
            }
            if new_analysis && analyses >= MAX_ANALYSES_PER_DAY {
                return Ok(ReserveOutcome::Denied("ANALYSES_PER_DAY"));
            }

            let reservation = Reservation {
                id: Uuid::new_v4().to_string(),
                day: day.clone(),
                ts_utc_db_ms: now_ms,
                model_key: model_key.clone(),
                reserved_cents: worst_case_cents,
                status: ReservationStatus::Reserved,
                correlation_id: correlation_id.clone(),
                expires_at_ms: now_ms + RESERVATION_TTL_MS,
            };

            tx.execute(
                "INSERT INTO ai_reservations
                    (id, day, ts_utc_db_ms, model_key, reserved_cents, actual_cents,
                     status, correlation_id, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'RESERVED', ?6, ?7)",
                params![
                    reservation.id,
                    reservation.day,
                    reservation.ts_utc_db_ms,
                    reservation.model_key,
                    reservation.reserved_cents,
                    reservation.correlation_id,
                    reservation.expires_at_ms
                ],
            )
            .context("insert reservation")?;

            tx.execute(
                "UPDATE ai_budget_day SET in_flight_cents = in_flight_cents + ?2 WHERE day = ?1",
                params![day, worst_case_cents],
            )?;

            Ok(ReserveOutcome::Reserved(reservation))
        })
    }

    /// Settle a reservation with the actual cost. Idempotent: the CAS on
    /// status means the loser of any race affects zero rows and returns
    /// false without touching the day counters.
    pub fn settle(&self, reservation_id: &str, actual_cents: Option<Cents>) -> Result<bool> {
        let id = reservation_id.to_string();

        self.store.with_tx(move |tx| {
            let updated = tx.execute(
                "UPDATE ai_reservations SET status = 'SETTLED', actual_cents = ?2
                 WHERE id = ?1 AND status = 'RESERVED'",
                params![id, actual_cents],
            )?;

            if updated == 0 {
                info!(reservation = %id, "RESERVATION_ALREADY_FINAL");
                return Ok(false);
            }

            let (day, reserved): (String, Cents) = tx.query_row(
                "SELECT day, reserved_cents FROM ai_reservations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let spent_delta = actual_cents.unwrap_or(reserved);
            tx.execute(
                "UPDATE ai_budget_day SET
                    in_flight_cents = in_flight_cents - ?2,
                    spent_cents = spent_cents + ?3
                 WHERE day = ?1",
                params![day, reserved, spent_delta],
            )?;

            Ok(true)
        })
    }

    /// Release a reservation whose model call never went out (e.g. the
    /// barrier rose between reserving and calling). Nothing is charged;
    /// released rows leave the rolling window entirely. Same CAS shape as
    /// settlement, so it is idempotent and race-safe against the reaper.
    pub fn release(&self, reservation_id: &str) -> Result<bool> {
        let id = reservation_id.to_string();

        self.store.with_tx(move |tx| {
            let updated = tx.execute(
                "UPDATE ai_reservations SET status = 'RELEASED'
                 WHERE id = ?1 AND status = 'RESERVED'",
                params![id],
            )?;
            if updated == 0 {
                info!(reservation = %id, "RESERVATION_ALREADY_FINAL");
                return Ok(false);
            }

            let (day, reserved): (String, Cents) = tx.query_row(
                "SELECT day, reserved_cents FROM ai_reservations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute(
                "UPDATE ai_budget_day SET in_flight_cents = in_flight_cents - ?2 WHERE day = ?1",
                params![day, reserved],
            )?;
            Ok(true)
        })
    }

    /// Reaper pass: force-settle reservations expired past the grace
    /// period, charging the full reserved amount. Returns the day's total
    /// force-settle count after this pass (the caller degrades cost
    /// accounting at the threshold when LIVE).
    pub fn reap(&self, now_ms: i64) -> Result<ReapReport> {
        let day = day_bucket(now_ms);

        self.store.with_tx(move |tx| {
            let expired: Vec<(String, String, Cents)> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT id, day, reserved_cents FROM ai_reservations
                     WHERE status = 'RESERVED' AND expires_at_ms < ?1",
                )?;
                let mut rows = stmt.query(params![now_ms - REAPER_GRACE_MS])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?, row.get(2)?));
                }
                out
            };

            let mut reaped = 0usize;
            for (id, res_day, reserved) in expired {
                // Same CAS discipline as settlement: a concurrent settle wins
                // cleanly and this update affects zero rows.
                let updated = tx.execute(
                    "UPDATE ai_reservations SET status = 'FORCE_SETTLED', actual_cents = reserved_cents
                     WHERE id = ?1 AND status = 'RESERVED'",
                    params![id],
                )?;
                if updated == 0 {
                    continue;
                }

                tx.execute(
                    "UPDATE ai_budget_day SET
                        in_flight_cents = in_flight_cents - ?2,
                        spent_cents = spent_cents + ?2,
                        force_settled_count = force_settled_count + 1
                     WHERE day = ?1",
                    params![res_day, reserved],
                )?;
                warn!(reservation = %id, reserved_cents = reserved, "reservation force-settled");
                reaped += 1;
            }

            let force_settled_today: i64 = tx
                .query_row(
                    "SELECT force_settled_count FROM ai_budget_day WHERE day = ?1",
                    params![day],
                    |row| row.get(0),
                )
                .unwrap_or(0);

            Ok(ReapReport {
                reaped,
                force_settled_today,
            })
        })
    }

    /// Day counters, for status and tests.
    pub fn day_totals(&self, day: &str) -> Result<(Cents, Cents)> {
        let day = day.to_string();
        self.store.with_conn(|conn| {
            let totals = conn
                .query_row(
                    "SELECT spent_cents, in_flight_cents FROM ai_budget_day WHERE day = ?1",
                    params![day],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap_or((0, 0));
            Ok(totals)
        })
    }
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy)]
pub struct ReapReport {
    pub reaped: usize,
    pub force_settled_today: i64,
}

impl ReapReport {
    /// True when LIVE cost accounting must degrade.
    pub fn degrades_cost_accounting(&self) -> bool {
        self.force_settled_today >= FORCE_SETTLE_DEGRADE_THRESHOLD
    }
}
