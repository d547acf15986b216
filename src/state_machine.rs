// =============================================================================
// State Machine — durable signed trading state, blockers, arming ceremony
// =============================================================================
//
// The durable state is a single signed row. Every mutation re-reads and
// re-verifies the row first; a bad signature forces HALTED, durably. HALTED
// is sticky and leaves only through a TOTP-authenticated unhalt.
// HALTED_DAILY expires at the next UTC midnight. LIVE_TRADING is reachable
// only from LIVE_ARMED via the two-step ceremony, and only within the
// process lifetime that armed it — startup unconditionally downgrades any
// persisted LIVE state.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::constant_time_eq;
use crate::event_store::{BotStateRow, EventStore};
use crate::totp::TotpValidator;
use crate::types::{HaltReason, TradingState};
use crate::wal::{StateChangedRecord, Wal, WalRecordKind};

type HmacSha256 = Hmac<Sha256>;

/// nonce1 lifetime.
const NONCE1_TTL_MS: i64 = 120_000;
/// Arming window after step one.
const ARMED_WINDOW_MS: i64 = 300_000;
/// Arming-file absolute age ceiling.
const ARMING_FILE_MAX_AGE_MS: i64 = 900_000;
/// Arming-file skew ceiling in either direction.
const ARMING_FILE_MAX_SKEW_MS: i64 = 300_000;
/// Tolerated difference between recorded and actual process start.
const PROCESS_START_TOLERANCE_MS: i64 = 5_000;

// ---------------------------------------------------------------------------
// Signed state
// ---------------------------------------------------------------------------

/// In-memory view of the signed singleton row.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedState {
    pub state: TradingState,
    pub counter: i64,
    pub ts_ms: i64,
    pub armed_until_ms: Option<i64>,
    pub halt_until_ms: Option<i64>,
    pub halt_resume_state: Option<TradingState>,
}

impl SignedState {
    fn canonical_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.state.as_str(),
            self.counter,
            self.ts_ms,
            self.armed_until_ms.map_or(String::from("-"), |v| v.to_string()),
            self.halt_until_ms.map_or(String::from("-"), |v| v.to_string()),
            self.halt_resume_state
                .map_or(String::from("-"), |s| s.as_str().to_string()),
        )
    }

    fn sign(&self, secret: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(self.canonical_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn to_row(&self, secret: &[u8]) -> BotStateRow {
        BotStateRow {
            state: self.state.as_str().to_string(),
            counter: self.counter,
            ts_ms: self.ts_ms,
            armed_until_ms: self.armed_until_ms,
            halt_until_ms: self.halt_until_ms,
            halt_resume_state: self.halt_resume_state.map(|s| s.as_str().to_string()),
            sig: self.sign(secret),
        }
    }

    fn from_row_verified(row: &BotStateRow, secret: &[u8]) -> Option<Self> {
        let state = TradingState::from_str_opt(&row.state)?;
        let halt_resume_state = match &row.halt_resume_state {
            Some(s) => Some(TradingState::from_str_opt(s)?),
            None => None,
        };
        let candidate = Self {
            state,
            counter: row.counter,
            ts_ms: row.ts_ms,
            armed_until_ms: row.armed_until_ms,
            halt_until_ms: row.halt_until_ms,
            halt_resume_state,
        };
        let expected = candidate.sign(secret);
        if constant_time_eq(expected.as_bytes(), row.sig.as_bytes()) {
            Some(candidate)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Arming file
// ---------------------------------------------------------------------------

/// Filesystem expectations for the local arming file. Owner checks are
/// parameterised so tests can run unprivileged.
#[derive(Debug, Clone)]
pub struct ArmingFilePolicy {
    pub path: String,
    pub expected_uid: Option<u32>,
    pub expected_gid: Option<u32>,
    pub expected_mode: u32,
}

impl ArmingFilePolicy {
    pub fn production(path: impl Into<String>, polyedge_gid: u32) -> Self {
        Self {
            path: path.into(),
            expected_uid: Some(0),
            expected_gid: Some(polyedge_gid),
            expected_mode: 0o640,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArmingFileBody {
    nonce2: String,
    /// UNIX seconds.
    ts_utc: i64,
    process_start_unix_ms: i64,
    sig: String,
}

/// Compute the arming-file signature over `nonce2|ts_utc|process_start`.
pub fn arming_file_sig(
    nonce2: &str,
    ts_utc: i64,
    process_start_unix_ms: i64,
    local_secret: &[u8],
) -> String {
    let mut mac = HmacSha256::new_from_slice(local_secret).expect("HMAC accepts any key size");
    mac.update(format!("{nonce2}|{ts_utc}|{process_start_unix_ms}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Validate the arming file against the expected nonce, process start, and
/// filesystem policy.
fn validate_arming_file(
    policy: &ArmingFilePolicy,
    expected_nonce2: &str,
    process_start_unix_ms: i64,
    now_ms: i64,
    local_secret: &[u8],
) -> Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let path = Path::new(&policy.path);
    let meta = std::fs::metadata(path)
        .with_context(|| format!("arming file missing at {}", path.display()))?;

    let mode = meta.permissions().mode() & 0o777;
    if mode != policy.expected_mode {
        anyhow::bail!("arming file mode {:o}, expected {:o}", mode, policy.expected_mode);
    }
    if let Some(uid) = policy.expected_uid {
        if meta.uid() != uid {
            anyhow::bail!("arming file uid {} != expected {}", meta.uid(), uid);
        }
    }
    if let Some(gid) = policy.expected_gid {
        if meta.gid() != gid {
            anyhow::bail!("arming file gid {} != expected {}", meta.gid(), gid);
        }
    }

    let content = std::fs::read_to_string(path).context("arming file unreadable")?;
    let body: ArmingFileBody =
        serde_json::from_str(content.trim()).context("arming file is not valid JSON")?;

    if body.nonce2 != expected_nonce2 {
        anyhow::bail!("arming file nonce mismatch");
    }

    let ts_ms = body.ts_utc * 1_000;
    if now_ms - ts_ms > ARMING_FILE_MAX_AGE_MS {
        anyhow::bail!("arming file too old");
    }
    if (now_ms - ts_ms).abs() > ARMING_FILE_MAX_SKEW_MS {
        anyhow::bail!("arming file timestamp skew too large");
    }
    if (body.process_start_unix_ms - process_start_unix_ms).abs() > PROCESS_START_TOLERANCE_MS {
        anyhow::bail!("arming file recorded a different process start");
    }

    let expected_sig = arming_file_sig(
        &body.nonce2,
        body.ts_utc,
        body.process_start_unix_ms,
        local_secret,
    );
    if !constant_time_eq(expected_sig.as_bytes(), body.sig.as_bytes()) {
        anyhow::bail!("arming file signature invalid");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct StateMachine {
    store: EventStore,
    wal: std::sync::Arc<Wal>,
    state_secret: Vec<u8>,
    local_secret: Vec<u8>,
    totp: TotpValidator,
    arming_policy: ArmingFilePolicy,
}

impl StateMachine {
    pub fn new(
        store: EventStore,
        wal: std::sync::Arc<Wal>,
        state_secret: Vec<u8>,
        local_secret: Vec<u8>,
        totp: TotpValidator,
        arming_policy: ArmingFilePolicy,
    ) -> Self {
        Self {
            store,
            wal,
            state_secret,
            local_secret,
            totp,
            arming_policy,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read and verify the durable state. A missing row initialises
    /// OBSERVE_ONLY; a signature failure durably forces HALTED. HALTED_DAILY
    /// past its expiry auto-transitions to its resume state.
    pub fn current(&self, now_ms: i64) -> Result<SignedState> {
        let row = self.store.read_bot_state_row()?;

        let state = match row {
            None => {
                let initial = SignedState {
                    state: TradingState::ObserveOnly,
                    counter: 1,
                    ts_ms: now_ms,
                    armed_until_ms: None,
                    halt_until_ms: None,
                    halt_resume_state: None,
                };
                self.persist(&initial, "INITIALIZED", now_ms)?;
                initial
            }
            Some(row) => match SignedState::from_row_verified(&row, &self.state_secret) {
                Some(state) => state,
                None => {
                    error!("bot_state signature verification failed — forcing HALTED");
                    return self.force_halted(HaltReason::SignatureInvalid, now_ms);
                }
            },
        };

        // HALTED_DAILY auto-expires at the recorded UTC midnight.
        if state.state == TradingState::HaltedDaily {
            if let Some(until) = state.halt_until_ms {
                if now_ms >= until {
                    let resume = state.halt_resume_state.unwrap_or(TradingState::ObserveOnly);
                    let next = SignedState {
                        state: resume,
                        counter: state.counter + 1,
                        ts_ms: now_ms,
                        armed_until_ms: None,
                        halt_until_ms: None,
                        halt_resume_state: None,
                    };
                    self.record_transition(&state, &next, "HALTED_DAILY_EXPIRED", now_ms)?;
                    return Ok(next);
                }
            }
        }

        Ok(state)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn persist(&self, state: &SignedState, reason: &str, now_ms: i64) -> Result<()> {
        self.store
            .write_bot_state_row(&state.to_row(&self.state_secret))?;
        self.store.append_event(
            "STATE_CHANGED",
            None,
            &serde_json::json!({
                "to": state.state.as_str(),
                "counter": state.counter,
                "reason": reason,
            }),
            now_ms,
        )?;
        Ok(())
    }

    fn record_transition(
        &self,
        from: &SignedState,
        to: &SignedState,
        reason: &str,
        now_ms: i64,
    ) -> Result<()> {
        self.wal.append(
            WalRecordKind::StateChanged,
            &StateChangedRecord {
                from: from.state.as_str().to_string(),
                to: to.state.as_str().to_string(),
                reason: reason.to_string(),
            },
            now_ms,
        )?;
        self.persist(to, reason, now_ms)?;
        info!(from = %from.state, to = %to.state, reason, "state transition");
        Ok(())
    }

    /// Durably force HALTED regardless of the current row's validity.
    pub fn force_halted(&self, reason: HaltReason, now_ms: i64) -> Result<SignedState> {
        let prior_counter = self
            .store
            .read_bot_state_row()?
            .map(|row| row.counter)
            .unwrap_or(0);

        let halted = SignedState {
            state: TradingState::Halted,
            counter: prior_counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };

        self.wal.append(
            WalRecordKind::StateChanged,
            &StateChangedRecord {
                from: "UNKNOWN".to_string(),
                to: TradingState::Halted.as_str().to_string(),
                reason: reason.as_str().to_string(),
            },
            now_ms,
        )?;
        self.persist(&halted, reason.as_str(), now_ms)?;
        warn!(reason = %reason, "engine HALTED");
        Ok(halted)
    }

    /// Operator or invariant halt from any state.
    pub fn halt(&self, reason: HaltReason, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if current.state == TradingState::Halted {
            return Ok(current);
        }
        let next = SignedState {
            state: TradingState::Halted,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, reason.as_str(), now_ms)?;
        Ok(next)
    }

    /// Daily stop: HALTED_DAILY until the next UTC midnight, resuming to
    /// PAPER_TRADING if that was the state when the stop hit, else
    /// OBSERVE_ONLY.
    pub fn halt_daily(&self, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        let resume = if current.state == TradingState::PaperTrading {
            TradingState::PaperTrading
        } else {
            TradingState::ObserveOnly
        };

        let next_midnight = next_utc_midnight_ms(now_ms);
        let next = SignedState {
            state: TradingState::HaltedDaily,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: Some(next_midnight),
            halt_resume_state: Some(resume),
        };
        self.record_transition(&current, &next, HaltReason::DailyStop.as_str(), now_ms)?;
        Ok(next)
    }

    /// TOTP-authenticated unhalt: HALTED -> OBSERVE_ONLY.
    pub fn unhalt(&self, totp_code: &str, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if current.state != TradingState::Halted {
            anyhow::bail!("unhalt requires HALTED, current state is {}", current.state);
        }
        if !self.totp.validate(totp_code, now_ms) {
            anyhow::bail!("invalid TOTP");
        }
        let next = SignedState {
            state: TradingState::ObserveOnly,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, "UNHALT", now_ms)?;
        Ok(next)
    }

    /// TOTP-authenticated resume of paper trading from OBSERVE_ONLY.
    pub fn resume_paper(&self, totp_code: &str, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if current.state != TradingState::ObserveOnly {
            anyhow::bail!(
                "resume_paper requires OBSERVE_ONLY, current state is {}",
                current.state
            );
        }
        if !self.totp.validate(totp_code, now_ms) {
            anyhow::bail!("invalid TOTP");
        }
        let next = SignedState {
            state: TradingState::PaperTrading,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, "RESUME_PAPER", now_ms)?;
        Ok(next)
    }

    /// Forced downgrade to OBSERVE_ONLY (clock skew, stale wallet
    /// reference, degraded cost accounting). No-op outside trading states.
    pub fn downgrade_to_observe(&self, reason: &str, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if !matches!(
            current.state,
            TradingState::PaperTrading | TradingState::LiveArmed | TradingState::LiveTrading
        ) {
            return Ok(current);
        }
        let next = SignedState {
            state: TradingState::ObserveOnly,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, reason, now_ms)?;
        Ok(next)
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Startup step 5: a persisted LIVE state can never survive a restart.
    pub fn startup_downgrade(&self, now_ms: i64) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if !matches!(
            current.state,
            TradingState::LiveArmed | TradingState::LiveTrading
        ) {
            return Ok(current);
        }

        let next = SignedState {
            state: TradingState::ObserveOnly,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, "STARTUP_LIVE_DOWNGRADE", now_ms)?;
        warn!(prior = %current.state, "persisted LIVE state downgraded at startup");
        Ok(next)
    }

    /// Startup step 6: remove a stale arming file if present.
    pub fn remove_arming_file(&self) -> Result<()> {
        let path = Path::new(&self.arming_policy.path);
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove arming file {}", path.display()))?;
            warn!(path = %path.display(), "stale arming file removed at startup");
        }
        Ok(())
    }

    /// Startup step 7.
    pub fn invalidate_nonces(&self) -> Result<()> {
        self.store.invalidate_all_nonces()
    }

    // -------------------------------------------------------------------------
    // Arming ceremony
    // -------------------------------------------------------------------------

    /// `/arm_live`: mint nonce1 (single-use, 120 s TTL).
    pub fn arm_live_init(&self, now_ms: i64) -> Result<String> {
        let current = self.current(now_ms)?;
        if !matches!(
            current.state,
            TradingState::ObserveOnly | TradingState::PaperTrading
        ) {
            anyhow::bail!("arming requires OBSERVE_ONLY or PAPER_TRADING, current is {}", current.state);
        }
        let nonce1 = Uuid::new_v4().simple().to_string();
        self.store.insert_nonce(&nonce1, 1, now_ms, NONCE1_TTL_MS)?;
        info!("arming nonce1 minted");
        Ok(nonce1)
    }

    /// Step one: consume nonce1 + TOTP, persist LIVE_ARMED, mint nonce2.
    pub fn confirm_step1(&self, nonce1: &str, totp_code: &str, now_ms: i64) -> Result<String> {
        let current = self.current(now_ms)?;
        if !matches!(
            current.state,
            TradingState::ObserveOnly | TradingState::PaperTrading
        ) {
            anyhow::bail!("step1 requires OBSERVE_ONLY or PAPER_TRADING");
        }

        if !self.totp.validate(totp_code, now_ms) {
            anyhow::bail!("invalid TOTP");
        }
        if !self.store.consume_nonce(nonce1, 1, now_ms)? {
            anyhow::bail!("nonce1 invalid, expired, or already used");
        }

        let armed_until = now_ms + ARMED_WINDOW_MS;
        let next = SignedState {
            state: TradingState::LiveArmed,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: Some(armed_until),
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, "ARM_STEP1", now_ms)?;

        let nonce2 = Uuid::new_v4().simple().to_string();
        self.store.insert_nonce(&nonce2, 2, now_ms, ARMED_WINDOW_MS)?;
        info!(armed_until_ms = armed_until, "LIVE_ARMED; nonce2 minted");
        Ok(nonce2)
    }

    /// Step two: validate state, nonce2, TOTP, and the local arming file,
    /// then — only once every check has passed — consume nonce2 and
    /// transition to LIVE_TRADING. A file-validation failure leaves the
    /// nonce intact so the operator can correct the file and retry inside
    /// the armed window. The file is deleted afterwards; a delete failure
    /// halts.
    pub fn confirm_step2(
        &self,
        nonce2: &str,
        totp_code: &str,
        process_start_unix_ms: i64,
        now_ms: i64,
    ) -> Result<SignedState> {
        let current = self.current(now_ms)?;
        if current.state != TradingState::LiveArmed {
            anyhow::bail!("step2 requires LIVE_ARMED, current is {}", current.state);
        }
        match current.armed_until_ms {
            Some(until) if now_ms <= until => {}
            _ => anyhow::bail!("arming window expired"),
        }

        if !self.store.nonce_usable(nonce2, 2, now_ms)? {
            anyhow::bail!("nonce2 invalid, expired, or already used");
        }
        if !self.totp.validate(totp_code, now_ms) {
            anyhow::bail!("invalid TOTP");
        }

        validate_arming_file(
            &self.arming_policy,
            nonce2,
            process_start_unix_ms,
            now_ms,
            &self.local_secret,
        )?;

        // All checks passed: consume the nonce. The CAS can still lose to
        // a concurrent step two, which counts as already used.
        if !self.store.consume_nonce(nonce2, 2, now_ms)? {
            anyhow::bail!("nonce2 already used");
        }

        let next = SignedState {
            state: TradingState::LiveTrading,
            counter: current.counter + 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
        };
        self.record_transition(&current, &next, "ARM_STEP2", now_ms)?;

        if let Err(e) = std::fs::remove_file(&self.arming_policy.path) {
            error!(error = %e, "failed to delete arming file after LIVE transition — halting");
            return self.force_halted(HaltReason::StartupFailure, now_ms);
        }

        info!("LIVE_TRADING armed");
        Ok(next)
    }
}

/// Next UTC midnight strictly after `now_ms`.
pub fn next_utc_midnight_ms(now_ms: i64) -> i64 {
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    let tomorrow = (now.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists");
    Utc.from_utc_datetime(&tomorrow).timestamp_millis()
}
