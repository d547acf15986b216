// =============================================================================
// Decision Engine — EV math, friction model, deterministic decision identity
// =============================================================================
//
// The decision id is a pure function of the canonical decision string, so
// identical inputs always derive the identical id — and therefore the
// identical client_order_id, which is what makes LIVE submits idempotent.
//
// All prices are payout-share units in [0, 1]. The friction total is the
// required edge that expected value must clear before a trade is allowed.
// =============================================================================

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RuntimeConfig;
use crate::snapshot::Snapshot;
use crate::types::{price_to_micros, Cents, ReasonCode, Side};

/// Raw AI shift beyond this refuses the decision outright.
const P_EFF_OUTLIER_BOUND: f64 = 0.20;
/// Extra EV over the minimum required before a marketable limit is allowed.
const TAKER_EV_MARGIN: f64 = 0.03;
/// Spread ceiling for a marketable limit.
const TAKER_MAX_SPREAD: f64 = 0.02;
/// Dispute risk at which the tighter delta bound applies.
const DISPUTE_RISK_TIGHT_BOUND: f64 = 0.7;
/// Spread ceiling on the traded side.
const MAX_SPREAD: f64 = 0.10;
/// Minimum USD resting at the best ask of the traded side.
const MIN_TOP_DEPTH_USD: f64 = 10.0;

// ---------------------------------------------------------------------------
// AI input
// ---------------------------------------------------------------------------

/// Calibrated AI output for one candidate, if the AI path ran.
#[derive(Debug, Clone, Copy)]
pub struct AiInput {
    /// Calibrated probability of YES.
    pub p_ai_cal: f64,
    /// Dispute risk in [0, 1].
    pub dispute_risk: f64,
    /// True when the evidence bundle needed the Tier-1 majority fallback.
    pub tier1_fallback: bool,
    /// Resolved outcomes in this market's category.
    pub resolved_outcomes: u32,
    /// Proposed influence weight from calibration.
    pub weight: f64,
}

/// Effective AI weight: zero until the category is calibrated, then capped.
pub fn ai_weight(input: &AiInput, config: &RuntimeConfig) -> f64 {
    if input.resolved_outcomes < config.calibration_min_outcomes {
        return 0.0;
    }
    input.weight.clamp(0.0, config.w_ai_max)
}

/// Shift p_market toward the calibrated probability, bounded by DELTA_MAX.
/// A raw shift beyond the outlier bound refuses the decision.
pub fn effective_probability(
    p_market: f64,
    ai: Option<&AiInput>,
    config: &RuntimeConfig,
) -> Result<f64, ReasonCode> {
    let Some(ai) = ai else {
        return Ok(p_market);
    };

    let w = ai_weight(ai, config);
    let raw_delta = w * (ai.p_ai_cal - p_market);
    if raw_delta.abs() > P_EFF_OUTLIER_BOUND {
        return Err(ReasonCode::PEffOutlier);
    }

    let delta_max = if ai.dispute_risk >= DISPUTE_RISK_TIGHT_BOUND {
        config.delta_max_disputed
    } else {
        config.delta_max
    };
    Ok(p_market + raw_delta.clamp(-delta_max, delta_max))
}

// ---------------------------------------------------------------------------
// Friction
// ---------------------------------------------------------------------------

/// Friction components, all in payout-share units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Friction {
    pub spread_cost: f64,
    pub fee_cost: f64,
    pub slippage: f64,
    pub dispute: f64,
    pub latency: f64,
    pub time_value: f64,
}

impl Friction {
    pub fn total(&self) -> f64 {
        self.spread_cost + self.fee_cost + self.slippage + self.dispute + self.latency
            + self.time_value
    }
}

/// Inputs to the friction model for one side of one market.
#[derive(Debug, Clone, Copy)]
pub struct FrictionInputs {
    /// Ask minus bid on the traded side.
    pub spread: f64,
    /// Venue fee rate in payout-share units (bps / 10_000).
    pub fee_rate: f64,
    /// True in PAPER mode (fee floor and multiplier apply).
    pub paper: bool,
    /// Order notional in USD.
    pub order_usd: f64,
    /// USD resting at the best ask of the traded side.
    pub top_depth_usd: f64,
    /// Dispute risk in [0, 1].
    pub dispute_risk: f64,
    /// Evidence bundle fell back to a Tier-1 majority.
    pub tier1_fallback: bool,
    /// Expected decision-to-execution delay in seconds.
    pub exec_delay_s: f64,
    /// Days until market resolution.
    pub days_to_resolution: f64,
}

/// Compute the friction (required edge) for one side.
pub fn friction(inputs: &FrictionInputs, config: &RuntimeConfig) -> Friction {
    let spread_cost = 0.5 * inputs.spread;

    let fee_floor = config.fee_floor_bps / 10_000.0;
    let fee_cost = if inputs.paper {
        inputs.fee_rate.max(fee_floor) * config.paper_fee_mult
    } else {
        inputs.fee_rate
    };

    let slippage = (inputs.order_usd / inputs.top_depth_usd.max(1.0) * 0.02).max(0.005);

    let mut dispute = 0.01 + 0.02 * inputs.dispute_risk;
    if inputs.tier1_fallback {
        dispute *= 1.5;
    }

    let latency = (inputs.exec_delay_s - 2.0).max(0.0) * 0.001;
    let time_value = (inputs.days_to_resolution * 0.0002).min(0.02);

    Friction {
        spread_cost,
        fee_cost,
        slippage,
        dispute,
        latency,
        time_value,
    }
}

// ---------------------------------------------------------------------------
// Decision record
// ---------------------------------------------------------------------------

/// Immutable record of a trade decision. The id is the SHA-256 of the
/// canonical string; the client order id is its first N hex chars, N pinned
/// by the signed manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub market_id: String,
    pub side: Side,
    pub snapshot_hash: String,
    pub price: f64,
    pub size_cents: Cents,
    pub p_market: f64,
    pub p_eff: f64,
    pub required_edge: f64,
    pub ev: f64,
    pub friction: Friction,
    /// True when the taker conditions held at decision time: EV at least
    /// EV_MIN + 0.03, spread at most 0.02, and realized volatility under
    /// the manifest-pinned sigma ceiling. Otherwise the submit is
    /// post-only.
    pub marketable_limit: bool,
    pub client_order_id: String,
    pub created_at_ms: i64,
}

/// Canonical serialization hashed into the decision id. Prices go through
/// fixed-point micros and the timestamp through a one-minute bucket so the
/// identity is stable across float formatting.
pub fn canonical_decision_string(
    market_id: &str,
    side: Side,
    snapshot_hash: &str,
    price: f64,
    size_cents: Cents,
    p_market: f64,
    p_eff: f64,
    required_edge: f64,
    ts_ms: i64,
) -> String {
    format!(
        "{market_id}|{side}|{snapshot_hash}|{}|{size_cents}|{}|{}|{}|{}",
        price_to_micros(price),
        price_to_micros(p_market),
        price_to_micros(p_eff),
        price_to_micros(required_edge),
        ts_ms / 60_000,
    )
}

pub fn decision_id_hex(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Outcome of evaluating one candidate.
#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    Trade(Decision),
    NoTrade(ReasonCode),
}

/// Evaluate one sized candidate against its snapshot. `size_cents` comes
/// from the risk manager; `client_order_id_len` and `taker_vol_sigma_max`
/// from the signed manifest. `realized_sigma` of None is treated as
/// too volatile for a marketable limit.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    snap: &Snapshot,
    ai: Option<&AiInput>,
    size_cents: Cents,
    fee_rate: f64,
    paper: bool,
    exec_delay_s: f64,
    days_to_resolution: f64,
    client_order_id_len: usize,
    realized_sigma: Option<f64>,
    taker_vol_sigma_max: f64,
    config: &RuntimeConfig,
    now_ms: i64,
) -> DecisionOutcome {
    if snap.invalid_book {
        return DecisionOutcome::NoTrade(ReasonCode::SnapshotInvalidBook);
    }
    if snap.ask_sum_anomaly {
        return DecisionOutcome::NoTrade(ReasonCode::SnapshotAskSumAnomaly);
    }

    // Feasibility baseline: the ask of the side being bought.
    let (ask_yes, ask_no) = match (snap.yes.best_ask, snap.no.best_ask) {
        (Some(y), Some(n)) => (y, n),
        _ => return DecisionOutcome::NoTrade(ReasonCode::SnapshotInvalidBook),
    };

    // p_eff is a probability of YES; the NO side trades against 1 - p_eff.
    let p_eff_yes = match effective_probability(ask_yes, ai, config) {
        Ok(p) => p,
        Err(code) => return DecisionOutcome::NoTrade(code),
    };

    let dispute_risk = ai.map(|a| a.dispute_risk).unwrap_or(0.0);
    let tier1_fallback = ai.map(|a| a.tier1_fallback).unwrap_or(false);
    let order_usd = size_cents as f64 / 100.0;

    let mut best: Option<(Side, f64, f64, f64, f64, Friction)> = None;
    for side in [Side::Yes, Side::No] {
        let book = snap.book(side);
        let (Some(spread), Some(entry)) = (book.spread(), book.best_ask) else {
            return DecisionOutcome::NoTrade(ReasonCode::SnapshotInvalidBook);
        };

        if spread > MAX_SPREAD {
            return DecisionOutcome::NoTrade(ReasonCode::SpreadTooWide);
        }
        if book.top_ask_depth_usd() < MIN_TOP_DEPTH_USD {
            return DecisionOutcome::NoTrade(ReasonCode::DepthTooThin);
        }

        let friction = friction(
            &FrictionInputs {
                spread,
                fee_rate,
                paper,
                order_usd,
                top_depth_usd: book.top_ask_depth_usd(),
                dispute_risk,
                tier1_fallback,
                exec_delay_s,
                days_to_resolution,
            },
            config,
        );
        let required_edge = friction.total();

        let p_side = match side {
            Side::Yes => p_eff_yes,
            Side::No => 1.0 - p_eff_yes,
        };
        let ev = p_side - entry - required_edge;

        let is_better = best.map_or(true, |(_, best_ev, ..)| ev > best_ev);
        if is_better {
            let p_market = match side {
                Side::Yes => ask_yes,
                Side::No => ask_no,
            };
            best = Some((side, ev, entry, p_market, required_edge, friction));
        }
    }

    let (side, ev, entry, p_market, required_edge, friction) =
        best.expect("both sides evaluated");

    if ev < config.ev_min {
        return DecisionOutcome::NoTrade(ReasonCode::EvTooLow);
    }

    let p_eff_side = match side {
        Side::Yes => p_eff_yes,
        Side::No => 1.0 - p_eff_yes,
    };

    let marketable_limit = ev >= config.ev_min + TAKER_EV_MARGIN
        && snap.book(side).spread().is_some_and(|s| s <= TAKER_MAX_SPREAD)
        && realized_sigma.is_some_and(|sigma| sigma <= taker_vol_sigma_max);

    let canonical = canonical_decision_string(
        &snap.market_id,
        side,
        &snap.content_hash,
        entry,
        size_cents,
        p_market,
        p_eff_side,
        required_edge,
        now_ms,
    );
    let id = decision_id_hex(&canonical);
    let client_order_id = id[..client_order_id_len.min(id.len())].to_string();

    DecisionOutcome::Trade(Decision {
        id: id.clone(),
        market_id: snap.market_id.clone(),
        side,
        snapshot_hash: snap.content_hash.clone(),
        price: entry,
        size_cents,
        p_market,
        p_eff: p_eff_side,
        required_edge,
        ev,
        friction,
        marketable_limit,
        client_order_id,
        created_at_ms: now_ms,
    })
}
