// =============================================================================
// Operator Alerts — dedup-keyed emission behind a pluggable notifier
// =============================================================================
//
// The control-channel adapter (Telegram, out of tree) implements Notifier;
// in-tree the TracingNotifier logs every alert. Alerts carry a dedup key so
// a flapping condition produces one notification per window, not a storm.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Repeated alerts with the same dedup key are suppressed for this long.
const DEDUP_WINDOW_MS: i64 = 300_000;

/// Alert categories emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    LiveTransition,
    StartupDowngrade,
    Halted,
    HaltedDaily,
    WsDown,
    ClockSkew,
    OrphanRisk,
    PendingUnknownMismatch,
    CostAccountingDegraded,
    ConfigTamper,
    WalletRefStale,
    MismatchEscalated,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiveTransition => "LIVE_TRANSITION",
            Self::StartupDowngrade => "STARTUP_DOWNGRADE",
            Self::Halted => "HALTED",
            Self::HaltedDaily => "HALTED_DAILY",
            Self::WsDown => "WS_DOWN",
            Self::ClockSkew => "CLOCK_SKEW",
            Self::OrphanRisk => "ORPHAN_RISK",
            Self::PendingUnknownMismatch => "PENDING_UNKNOWN_MISMATCH",
            Self::CostAccountingDegraded => "COST_ACCOUNTING_DEGRADED",
            Self::ConfigTamper => "CONFIG_TAMPER",
            Self::WalletRefStale => "WALLET_REF_STALE",
            Self::MismatchEscalated => "MISMATCH_ESCALATED",
        }
    }
}

/// One operator alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub dedup_key: String,
    pub message: String,
    pub at_ms: i64,
}

/// Delivery transport for alerts.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Default in-tree notifier: structured log lines.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, alert: &Alert) {
        warn!(
            kind = alert.kind.as_str(),
            dedup_key = %alert.dedup_key,
            "ALERT: {}",
            alert.message
        );
    }
}

/// Dedup-keyed alert fan-out.
pub struct AlertManager {
    notifier: Arc<dyn Notifier>,
    last_sent: Mutex<HashMap<String, i64>>,
}

impl AlertManager {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Emit an alert unless one with the same dedup key fired within the
    /// window. Returns whether it was delivered.
    pub fn emit(&self, kind: AlertKind, dedup_key: &str, message: impl Into<String>, now_ms: i64) -> bool {
        {
            let mut last = self.last_sent.lock();
            if let Some(&sent_at) = last.get(dedup_key) {
                if now_ms - sent_at < DEDUP_WINDOW_MS {
                    return false;
                }
            }
            last.insert(dedup_key.to_string(), now_ms);
        }

        let alert = Alert {
            kind,
            dedup_key: dedup_key.to_string(),
            message: message.into(),
            at_ms: now_ms,
        };
        self.notifier.notify(&alert);
        true
    }
}
