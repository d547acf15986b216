// =============================================================================
// Shared types used across the PolyEdge trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Money and price units
// ---------------------------------------------------------------------------

/// Monetary amounts are carried as integer USD cents wherever they are
/// persisted or hashed.
pub type Cents = i64;

/// Prices are persisted as fixed-point integers with six fractional digits.
pub const PRICE_SCALE: i64 = 1_000_000;

/// Convert a payout-share price (0.0 ..= 1.0) to fixed-point micros.
pub fn price_to_micros(price: f64) -> i64 {
    (price * PRICE_SCALE as f64).round() as i64
}

/// Convert fixed-point micros back to a floating price.
pub fn micros_to_price(micros: i64) -> f64 {
    micros as f64 / PRICE_SCALE as f64
}

/// Convert a USD amount to integer cents.
pub fn usd_to_cents(usd: f64) -> Cents {
    (usd * 100.0).round() as Cents
}

/// Convert integer cents to a USD float (display and EV math only).
pub fn cents_to_usd(cents: Cents) -> f64 {
    cents as f64 / 100.0
}

// ---------------------------------------------------------------------------
// Durable trading state
// ---------------------------------------------------------------------------

/// The durable, signed trading state of the engine.
///
/// HALTED is sticky and requires a TOTP-authenticated unhalt. LIVE_TRADING
/// is reachable only from LIVE_ARMED within the same process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingState {
    ObserveOnly,
    PaperTrading,
    LiveArmed,
    LiveTrading,
    Halted,
    HaltedDaily,
}

impl TradingState {
    /// Stable wire name used in signatures, WAL records, and the event log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObserveOnly => "OBSERVE_ONLY",
            Self::PaperTrading => "PAPER_TRADING",
            Self::LiveArmed => "LIVE_ARMED",
            Self::LiveTrading => "LIVE_TRADING",
            Self::Halted => "HALTED",
            Self::HaltedDaily => "HALTED_DAILY",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "OBSERVE_ONLY" => Some(Self::ObserveOnly),
            "PAPER_TRADING" => Some(Self::PaperTrading),
            "LIVE_ARMED" => Some(Self::LiveArmed),
            "LIVE_TRADING" => Some(Self::LiveTrading),
            "HALTED" => Some(Self::Halted),
            "HALTED_DAILY" => Some(Self::HaltedDaily),
            _ => None,
        }
    }

    /// True when new exposure may be created in this state (blockers and
    /// RECONCILE_GREEN are checked separately).
    pub fn allows_trading(&self) -> bool {
        matches!(self, Self::PaperTrading | Self::LiveTrading)
    }
}

impl Default for TradingState {
    fn default() -> Self {
        Self::ObserveOnly
    }
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market side
// ---------------------------------------------------------------------------

/// Which outcome token a trade buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order lifecycle
// ---------------------------------------------------------------------------

/// Local order status. PENDING_UNKNOWN marks an ambiguous submit or cancel
/// outcome awaiting reconciliation; while any order carries it, no new
/// exposure may be created anywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    Open,
    PartiallyFilled,
    Filled,
    CancelRequested,
    Cancelled,
    PendingUnknown,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingSubmit => "PENDING_SUBMIT",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Cancelled => "CANCELLED",
            Self::PendingUnknown => "PENDING_UNKNOWN",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PENDING_SUBMIT" => Some(Self::PendingSubmit),
            "OPEN" => Some(Self::Open),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCEL_REQUESTED" => Some(Self::CancelRequested),
            "CANCELLED" => Some(Self::Cancelled),
            "PENDING_UNKNOWN" => Some(Self::PendingUnknown),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Statuses that still represent live exposure at the venue.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::PendingSubmit
                | Self::Open
                | Self::PartiallyFilled
                | Self::CancelRequested
                | Self::PendingUnknown
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally tracked order linked to the decision that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub decision_id: String,
    pub market_id: String,
    pub side: Side,
    pub status: OrderStatus,
    /// First N hex chars of the decision hash; N comes from the signed
    /// manifest (venue maximum).
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub price_micros: i64,
    pub size_cents: Cents,
    pub filled_cents: Cents,
    pub residual_cents: Cents,
    pub pending_unknown_since_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub paper: bool,
}

// ---------------------------------------------------------------------------
// Candidate lifecycle
// ---------------------------------------------------------------------------

/// Candidate status progression. Transitions are monotonic; `state_version`
/// increments on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    New,
    Filtered,
    EvidenceDone,
    AiDone,
    Decided,
    Executed,
    Dropped,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Filtered => "FILTERED",
            Self::EvidenceDone => "EVIDENCE_DONE",
            Self::AiDone => "AI_DONE",
            Self::Decided => "DECIDED",
            Self::Executed => "EXECUTED",
            Self::Dropped => "DROPPED",
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A market that triggered evaluation, pinned to the snapshot it was
/// produced from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub market_id: String,
    pub snapshot_id: String,
    pub snapshot_hash: String,
    pub created_at_ms: i64,
    pub trigger_reasons: Vec<String>,
    pub status: CandidateStatus,
    pub state_version: u64,
}

impl Candidate {
    pub fn advance(&mut self, status: CandidateStatus) {
        self.status = status;
        self.state_version += 1;
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at_ms
    }
}

// ---------------------------------------------------------------------------
// Blockers
// ---------------------------------------------------------------------------

/// In-memory fail-closed blockers, orthogonal to the durable state. Any set
/// blocker forbids new exposure; all but COST_ACCOUNTING_DEGRADED forbid
/// PAPER as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Blocker {
    WsDown,
    DbDegraded,
    WalDegraded,
    ReconcileDegraded,
    ClockSkew,
    CostAccountingDegraded,
    InjectionDetectorInvalid,
}

impl Blocker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WsDown => "WS_DOWN",
            Self::DbDegraded => "DB_DEGRADED",
            Self::WalDegraded => "WAL_DEGRADED",
            Self::ReconcileDegraded => "RECONCILE_DEGRADED",
            Self::ClockSkew => "CLOCK_SKEW",
            Self::CostAccountingDegraded => "COST_ACCOUNTING_DEGRADED",
            Self::InjectionDetectorInvalid => "INJECTION_DETECTOR_INVALID",
        }
    }

    /// Blockers in this subset still allow PAPER trading to continue.
    pub fn paper_tolerated(&self) -> bool {
        matches!(self, Self::CostAccountingDegraded)
    }
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reason codes
// ---------------------------------------------------------------------------

/// Canonical NO_TRADE / abort reason codes recorded in the event log. Every
/// fail-closed path surfaces exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    WsUnhealthyDecision,
    WsUnhealthyExec,
    SnapshotInvalidBook,
    SnapshotAskSumAnomaly,
    SpreadTooWide,
    DepthTooThin,
    MarketNotEligible,
    TimeToResolutionOutOfRange,
    EvidenceRequired,
    EvidenceConflict,
    EvidenceTier1Insufficient,
    InjectionDetected,
    AiBudgetDenied,
    AiQuorumFailed,
    AiDisagreement,
    AiSchemaInvalid,
    AiTimeout,
    PEffOutlier,
    EvTooLow,
    RiskLimitHit,
    ReconcileNotGreen,
    LockLost,
    LockVersionChanged,
    LockExpiringSoon,
    BarrierActive,
    StateNotTrading,
    CandidateExpired,
    DecisionExecDelayExceeded,
    MarketCooloff,
    MismatchActive,
    WalletRefStale,
    DuplicateClientOrderId,
    CancelUnconfirmed,
    WalWriteFailed,
    EventStoreWriteFailed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WsUnhealthyDecision => "WS_UNHEALTHY_DECISION",
            Self::WsUnhealthyExec => "WS_UNHEALTHY_EXEC",
            Self::SnapshotInvalidBook => "SNAPSHOT_INVALID_BOOK",
            Self::SnapshotAskSumAnomaly => "SNAPSHOT_ASK_SUM_ANOMALY",
            Self::SpreadTooWide => "SPREAD_TOO_WIDE",
            Self::DepthTooThin => "DEPTH_TOO_THIN",
            Self::MarketNotEligible => "MARKET_NOT_ELIGIBLE",
            Self::TimeToResolutionOutOfRange => "TIME_TO_RESOLUTION_OUT_OF_RANGE",
            Self::EvidenceRequired => "EVIDENCE_REQUIRED",
            Self::EvidenceConflict => "EVIDENCE_CONFLICT",
            Self::EvidenceTier1Insufficient => "EVIDENCE_TIER1_INSUFFICIENT",
            Self::InjectionDetected => "INJECTION_DETECTED",
            Self::AiBudgetDenied => "AI_BUDGET_DENIED",
            Self::AiQuorumFailed => "AI_QUORUM_FAILED",
            Self::AiDisagreement => "AI_DISAGREEMENT",
            Self::AiSchemaInvalid => "AI_SCHEMA_INVALID",
            Self::AiTimeout => "AI_TIMEOUT",
            Self::PEffOutlier => "P_EFF_OUTLIER",
            Self::EvTooLow => "EV_TOO_LOW",
            Self::RiskLimitHit => "RISK_LIMIT_HIT",
            Self::ReconcileNotGreen => "RECONCILE_NOT_GREEN",
            Self::LockLost => "LOCK_LOST",
            Self::LockVersionChanged => "LOCK_VERSION_CHANGED",
            Self::LockExpiringSoon => "LOCK_EXPIRING_SOON",
            Self::BarrierActive => "BARRIER_ACTIVE",
            Self::StateNotTrading => "STATE_NOT_TRADING",
            Self::CandidateExpired => "CANDIDATE_EXPIRED",
            Self::DecisionExecDelayExceeded => "DECISION_EXEC_DELAY_EXCEEDED",
            Self::MarketCooloff => "MARKET_COOLOFF",
            Self::MismatchActive => "MISMATCH_ACTIVE",
            Self::WalletRefStale => "WALLET_REF_STALE",
            Self::DuplicateClientOrderId => "DUPLICATE_CLIENT_ORDER_ID",
            Self::CancelUnconfirmed => "CANCEL_UNCONFIRMED",
            Self::WalWriteFailed => "WAL_WRITE_FAILED",
            Self::EventStoreWriteFailed => "EVENT_STORE_WRITE_FAILED",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Halt reasons
// ---------------------------------------------------------------------------

/// Reasons for a durable transition into HALTED. Recorded in the event log
/// and carried in the operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    PendingUnknownMismatch,
    OrphanRisk,
    ResidualCancelUnknown,
    LockRenewFailedDuringPendingUnknown,
    MarkUnavailable,
    SignatureInvalid,
    ConfigTamper,
    SecretPermissions,
    WalReplayFailed,
    StartupFailure,
    DailyStop,
    Operator,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingUnknownMismatch => "PENDING_UNKNOWN_MISMATCH",
            Self::OrphanRisk => "ORPHAN_RISK",
            Self::ResidualCancelUnknown => "RESIDUAL_CANCEL_UNKNOWN",
            Self::LockRenewFailedDuringPendingUnknown => {
                "LOCK_RENEW_FAILED_DURING_PENDING_UNKNOWN"
            }
            Self::MarkUnavailable => "MARK_UNAVAILABLE",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::ConfigTamper => "CONFIG_TAMPER",
            Self::SecretPermissions => "SECRET_PERMISSIONS",
            Self::WalReplayFailed => "WAL_REPLAY_FAILED",
            Self::StartupFailure => "STARTUP_FAILURE",
            Self::DailyStop => "DAILY_STOP",
            Self::Operator => "OPERATOR",
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ambiguity-aware outcome
// ---------------------------------------------------------------------------

/// Tagged outcome of any operation against the venue that may end
/// ambiguously. Never collapse Ambiguous into a nullable success.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    AbsentConfirmed,
    Ambiguous(String),
}

impl<T> Outcome<T> {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous(_))
    }
}

// ---------------------------------------------------------------------------
// Core error taxonomy
// ---------------------------------------------------------------------------

/// Typed error kinds for the correctness core. Transport-transient errors
/// are never retried inside the core; transport-ambiguous errors always
/// become PENDING_UNKNOWN.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("input validation failed: {0}")]
    Validation(String),

    #[error("transient transport error: {0}")]
    TransportTransient(String),

    #[error("ambiguous transport outcome: {0}")]
    TransportAmbiguous(String),

    #[error("persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("invariant breach: {0}")]
    InvariantBreach(String),

    #[error("calibration degraded")]
    CalibrationDegraded,

    #[error("AI budget exhausted")]
    BudgetExhausted,

    #[error("barrier active")]
    BarrierActive,

    #[error("market lock lost")]
    LockLost,
}
