// =============================================================================
// Risk Manager — sizing caps, TWAP risk-mark, wallet reference, daily stop
// =============================================================================
//
// Sizing is the minimum of the per-market cap, the remaining total-exposure
// capacity, and the venue's available balance. Positions are marked to a
// 300-second TWAP of validated mid samples; the wallet reference refreshes
// only from TWAP- or trade-backed marks, never from the entry-price
// fallback. The daily stop trips HALTED_DAILY at -3% of the wallet
// reference. Daily counters reset when the UTC date rolls over.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::types::{Cents, ReasonCode};

/// TWAP window.
const MARK_WINDOW_MS: i64 = 300_000;
/// Minimum samples for a TWAP mark.
const MARK_MIN_SAMPLES: usize = 3;
/// Minimum span the samples must cover.
const MARK_MIN_SPAN_MS: i64 = 60_000;
/// Sample count at which outlier rejection replaces the median.
const MARK_SIGMA_SAMPLES: usize = 10;
/// Maximum spread for a valid sample.
const SAMPLE_MAX_SPREAD_FRAC: f64 = 0.10;
/// Minimum top-of-book depth for a valid sample.
const SAMPLE_MIN_DEPTH_USD: f64 = 50.0;
/// Last-trade fallback freshness.
const LAST_TRADE_MAX_AGE_MS: i64 = 600_000;
/// Entry-price fallback grace after opening.
const ENTRY_FALLBACK_MS: i64 = 300_000;
/// Consecutive mark failures before the engine must halt.
const MARK_FAILURES_BEFORE_HALT: u32 = 3;
/// Wallet reference staleness ceiling.
pub const WALLET_REF_STALE_MS: i64 = 3_600_000;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Inputs to the sizing decision, gathered by the worker.
#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub wallet_cents: Cents,
    pub current_exposure_cents: Cents,
    pub open_positions: u32,
    pub venue_available_cents: Cents,
}

/// Size a new position, enforcing the per-market cap, total exposure cap,
/// and open-position count.
pub fn size_position(inputs: &SizingInputs, config: &RuntimeConfig) -> Result<Cents, ReasonCode> {
    if inputs.open_positions >= config.max_open_positions {
        return Err(ReasonCode::RiskLimitHit);
    }

    let per_market =
        (inputs.wallet_cents as f64 * config.max_per_market_pct / 100.0).floor() as Cents;
    let total_cap =
        (inputs.wallet_cents as f64 * config.max_total_exposure_pct / 100.0).floor() as Cents;
    let remaining = total_cap - inputs.current_exposure_cents;

    let size = per_market.min(remaining).min(inputs.venue_available_cents);
    if size <= 0 {
        return Err(ReasonCode::RiskLimitHit);
    }
    Ok(size)
}

// ---------------------------------------------------------------------------
// TWAP mark
// ---------------------------------------------------------------------------

/// One candidate mid sample.
#[derive(Debug, Clone, Copy)]
struct MidSample {
    ts_ms: i64,
    mid: f64,
}

/// Where a mark came from. Only Twap and LastTrade may refresh the wallet
/// reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkSource {
    Twap,
    LastTrade,
    EntryPrice,
}

impl MarkSource {
    pub fn refreshes_wallet(&self) -> bool {
        matches!(self, Self::Twap | Self::LastTrade)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Mark {
    pub price: f64,
    pub source: MarkSource,
}

/// Rolling per-market sample buffer feeding the TWAP mark.
#[derive(Debug, Default)]
pub struct MarkBuffer {
    samples: Vec<MidSample>,
}

impl MarkBuffer {
    /// Offer a sample. Invalid samples (missing side, wide spread, thin
    /// depth) are dropped. Returns whether the sample was accepted.
    pub fn offer(
        &mut self,
        bid: Option<f64>,
        ask: Option<f64>,
        top_depth_usd: f64,
        now_ms: i64,
    ) -> bool {
        let (Some(bid), Some(ask)) = (bid, ask) else {
            return false;
        };
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            return false;
        }
        if (ask - bid) / mid > SAMPLE_MAX_SPREAD_FRAC {
            return false;
        }
        if top_depth_usd < SAMPLE_MIN_DEPTH_USD {
            return false;
        }

        self.samples.push(MidSample { ts_ms: now_ms, mid });
        self.samples
            .retain(|s| now_ms - s.ts_ms <= MARK_WINDOW_MS);
        true
    }

    /// Realized standard deviation of window mids. Needs at least three
    /// samples; feeds the marketable-limit volatility gate.
    fn sigma(&self, now_ms: i64) -> Option<f64> {
        let mids: Vec<f64> = self
            .samples
            .iter()
            .filter(|s| now_ms - s.ts_ms <= MARK_WINDOW_MS)
            .map(|s| s.mid)
            .collect();
        if mids.len() < MARK_MIN_SAMPLES {
            return None;
        }
        let mean = mids.iter().sum::<f64>() / mids.len() as f64;
        let variance = mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / mids.len() as f64;
        Some(variance.sqrt())
    }

    /// Compute the TWAP mark from the current window, if the sample set
    /// qualifies.
    fn twap(&self, now_ms: i64) -> Option<f64> {
        let live: Vec<&MidSample> = self
            .samples
            .iter()
            .filter(|s| now_ms - s.ts_ms <= MARK_WINDOW_MS)
            .collect();

        if live.len() < MARK_MIN_SAMPLES {
            return None;
        }
        let span = live.last()?.ts_ms - live.first()?.ts_ms;
        if span < MARK_MIN_SPAN_MS {
            return None;
        }

        let mids: Vec<f64> = live.iter().map(|s| s.mid).collect();
        if mids.len() >= MARK_SIGMA_SAMPLES {
            let mean = mids.iter().sum::<f64>() / mids.len() as f64;
            let variance =
                mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / mids.len() as f64;
            let sigma = variance.sqrt();
            let kept: Vec<f64> = mids
                .iter()
                .copied()
                .filter(|m| sigma == 0.0 || (m - mean).abs() <= 2.0 * sigma)
                .collect();
            Some(kept.iter().sum::<f64>() / kept.len() as f64)
        } else {
            let mut sorted = mids;
            sorted.sort_by(|a, b| a.partial_cmp(b).expect("mids are finite"));
            Some(sorted[sorted.len() / 2])
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    buffers: HashMap<String, MarkBuffer>,
    consecutive_mark_failures: HashMap<String, u32>,
    daily_pnl_cents: Cents,
    current_date: String,
}

/// Risk manager: mark buffers, daily PnL, and the stop predicates.
pub struct RiskManager {
    state: RwLock<Inner>,
}

impl RiskManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Inner {
                buffers: HashMap::new(),
                consecutive_mark_failures: HashMap::new(),
                daily_pnl_cents: 0,
                current_date: Utc::now().format("%Y-%m-%d").to_string(),
            }),
        }
    }

    /// Realized mid-price sigma over the mark window, if enough samples
    /// exist. None means "not demonstrably calm": callers must treat it as
    /// high volatility.
    pub fn realized_sigma(&self, market_id: &str, now_ms: i64) -> Option<f64> {
        self.state
            .read()
            .buffers
            .get(market_id)
            .and_then(|buffer| buffer.sigma(now_ms))
    }

    /// Feed a book observation into the market's mark buffer.
    pub fn offer_sample(
        &self,
        market_id: &str,
        bid: Option<f64>,
        ask: Option<f64>,
        top_depth_usd: f64,
        now_ms: i64,
    ) -> bool {
        let mut s = self.state.write();
        s.buffers
            .entry(market_id.to_string())
            .or_default()
            .offer(bid, ask, top_depth_usd, now_ms)
    }

    /// Compute the risk mark for a market, walking the fallback ladder:
    /// TWAP, then a fresh last trade, then the entry price for the first
    /// 300 s after opening. Returns Err(failures) when no source holds;
    /// three consecutive failures require a HALT.
    pub fn mark(
        &self,
        market_id: &str,
        last_trade: Option<(f64, i64)>,
        entry: Option<(f64, i64)>,
        now_ms: i64,
    ) -> Result<Mark, u32> {
        let mut s = self.state.write();

        let twap = s
            .buffers
            .get(market_id)
            .and_then(|buffer| buffer.twap(now_ms));

        let mark = if let Some(price) = twap {
            Some(Mark {
                price,
                source: MarkSource::Twap,
            })
        } else if let Some((price, ts_ms)) = last_trade {
            (now_ms - ts_ms <= LAST_TRADE_MAX_AGE_MS).then_some(Mark {
                price,
                source: MarkSource::LastTrade,
            })
        } else {
            None
        };

        let mark = mark.or_else(|| {
            entry.and_then(|(price, opened_at_ms)| {
                (now_ms - opened_at_ms <= ENTRY_FALLBACK_MS).then_some(Mark {
                    price,
                    source: MarkSource::EntryPrice,
                })
            })
        });

        match mark {
            Some(mark) => {
                s.consecutive_mark_failures.insert(market_id.to_string(), 0);
                Ok(mark)
            }
            None => {
                let failures = s
                    .consecutive_mark_failures
                    .entry(market_id.to_string())
                    .or_insert(0);
                *failures += 1;
                warn!(market = market_id, failures = *failures, "risk mark unavailable");
                Err(*failures)
            }
        }
    }

    /// True when the failure count for any market demands a HALT.
    pub fn mark_failures_require_halt(failures: u32) -> bool {
        failures >= MARK_FAILURES_BEFORE_HALT
    }

    // ── Daily PnL ───────────────────────────────────────────────────────

    /// Record realized PnL from a closed position or settled fill.
    pub fn record_pnl(&self, pnl_cents: Cents) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_pnl_cents += pnl_cents;
        debug!(pnl_cents, daily_pnl_cents = s.daily_pnl_cents, "pnl recorded");
    }

    pub fn daily_pnl_cents(&self) -> Cents {
        self.maybe_reset_daily();
        self.state.read().daily_pnl_cents
    }

    /// Daily stop predicate: losses at or past the configured percentage of
    /// the wallet reference.
    pub fn daily_stop_hit(&self, wallet_cents: Cents, config: &RuntimeConfig) -> bool {
        self.maybe_reset_daily();
        let pnl = self.state.read().daily_pnl_cents;
        let stop = -(wallet_cents as f64 * config.daily_stop_pct / 100.0);
        (pnl as f64) <= stop
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — daily pnl reset");
            s.daily_pnl_cents = 0;
            s.current_date = today;
        }
    }
}

impl Default for RiskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wallet reference staleness check (stale forces OBSERVE_ONLY with
/// WALLET_REF_STALE).
pub fn wallet_ref_stale(updated_at_ms: i64, now_ms: i64) -> bool {
    now_ms - updated_at_ms > WALLET_REF_STALE_MS
}
