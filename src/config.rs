// =============================================================================
// Runtime Configuration & Signed Manifest — PolyEdge
// =============================================================================
//
// Two layers of configuration:
//
//   1. RuntimeConfig — hot-loadable JSON tunables. Every field carries
//      `#[serde(default)]` so that adding new fields never breaks loading an
//      older config file. Persistence uses the atomic tmp + rename pattern.
//
//   2. Manifest — the signed manifest covering config artifacts, the
//      injection-pattern ruleset, AI model pricing, the operator allowlist,
//      and venue constants (client_order_id max length, tick size, taker
//      volatility ceiling). Signature failure at startup forces HALTED.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_markets() -> Vec<String> {
    Vec::new()
}

fn default_max_per_market_pct() -> f64 {
    2.0
}

fn default_max_open_positions() -> u32 {
    5
}

fn default_max_total_exposure_pct() -> f64 {
    10.0
}

fn default_daily_stop_pct() -> f64 {
    3.0
}

fn default_ev_min() -> f64 {
    0.01
}

fn default_delta_max() -> f64 {
    0.10
}

fn default_delta_max_disputed() -> f64 {
    0.05
}

fn default_w_ai_max() -> f64 {
    0.35
}

fn default_calibration_min_outcomes() -> u32 {
    50
}

fn default_decision_freshness_ms() -> i64 {
    6_000
}

fn default_exec_freshness_ms() -> i64 {
    3_000
}

fn default_candidate_max_age_ms() -> i64 {
    120_000
}

fn default_decision_to_exec_max_ms() -> i64 {
    8_000
}

fn default_reconcile_heartbeat_s() -> u64 {
    60
}

fn default_market_cooloff_ms() -> i64 {
    300_000
}

fn default_paper_fee_mult() -> f64 {
    2.0
}

fn default_fee_floor_bps() -> f64 {
    10.0
}

fn default_db_path() -> String {
    "polyedge.db".to_string()
}

fn default_wal_path() -> String {
    "polyedge.wal".to_string()
}

fn default_manifest_path() -> String {
    "manifest.json".to_string()
}

fn default_arming_file_path() -> String {
    "/var/run/polyedge/armed".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Hot-loadable engine tunables.
///
/// The durable trading state does NOT live here; it is owned by the state
/// machine and persisted with a signature in the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Watchlist ----------------------------------------------------------
    /// Markets the engine is watching and may trade.
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,

    // --- Risk limits --------------------------------------------------------
    /// Maximum notional per market as a percentage of the wallet reference.
    #[serde(default = "default_max_per_market_pct")]
    pub max_per_market_pct: f64,

    /// Maximum number of concurrently open positions.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    /// Maximum total exposure as a percentage of the wallet reference.
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: f64,

    /// Daily loss percentage that trips HALTED_DAILY.
    #[serde(default = "default_daily_stop_pct")]
    pub daily_stop_pct: f64,

    // --- Decision thresholds ------------------------------------------------
    /// Minimum expected value after friction required to trade.
    #[serde(default = "default_ev_min")]
    pub ev_min: f64,

    /// Hard bound on |p_eff - p_market|.
    #[serde(default = "default_delta_max")]
    pub delta_max: f64,

    /// Tighter bound applied when dispute risk >= 0.7.
    #[serde(default = "default_delta_max_disputed")]
    pub delta_max_disputed: f64,

    /// Ceiling on the AI influence weight once calibrated.
    #[serde(default = "default_w_ai_max")]
    pub w_ai_max: f64,

    /// Resolved outcomes required per category before w_ai rises above zero.
    #[serde(default = "default_calibration_min_outcomes")]
    pub calibration_min_outcomes: u32,

    // --- Freshness bounds ---------------------------------------------------
    /// WS freshness bound for decisions (milliseconds).
    #[serde(default = "default_decision_freshness_ms")]
    pub decision_freshness_ms: i64,

    /// WS freshness bound for execution (milliseconds).
    #[serde(default = "default_exec_freshness_ms")]
    pub exec_freshness_ms: i64,

    /// Maximum candidate age at the pre-exec gate (milliseconds).
    #[serde(default = "default_candidate_max_age_ms")]
    pub candidate_max_age_ms: i64,

    /// Maximum decision-to-execution delay (milliseconds).
    #[serde(default = "default_decision_to_exec_max_ms")]
    pub decision_to_exec_max_ms: i64,

    // --- Reconciliation & cool-off -----------------------------------------
    /// Reconciliation heartbeat interval (seconds).
    #[serde(default = "default_reconcile_heartbeat_s")]
    pub reconcile_heartbeat_s: u64,

    /// Market cool-off after ABSENT_CONFIRMED (milliseconds).
    #[serde(default = "default_market_cooloff_ms")]
    pub market_cooloff_ms: i64,

    // --- Paper model --------------------------------------------------------
    /// Fee multiplier applied to paper fills.
    #[serde(default = "default_paper_fee_mult")]
    pub paper_fee_mult: f64,

    /// Fee floor in basis points applied in paper mode.
    #[serde(default = "default_fee_floor_bps")]
    pub fee_floor_bps: f64,

    // --- Paths & endpoints --------------------------------------------------
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_wal_path")]
    pub wal_path: String,

    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Fixed path of the local arming file (step two of the LIVE ceremony).
    #[serde(default = "default_arming_file_path")]
    pub arming_file_path: String,

    /// Bind address for the operator control API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            markets = ?config.markets,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Signed manifest
// =============================================================================

/// The signed manifest pins everything the engine must not silently change
/// under: artifact hashes, venue constants, model pricing, and the operator
/// allowlist. The signature is HMAC-SHA256 over the canonical string with
/// the manifest secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// SHA-256 hex digests of every covered config artifact, keyed by
    /// relative path. BTreeMap keeps the canonical order deterministic.
    pub artifacts: BTreeMap<String, String>,

    /// Maximum client_order_id length accepted by the venue.
    pub client_order_id_max_len: usize,

    /// Venue quoted price increment (the paper fill rule's tick).
    pub venue_tick: f64,

    /// Realized 5-minute mid-price sigma ceiling for marketable limits.
    pub taker_vol_sigma_max: f64,

    /// Pinned per-call worst-case USD cents per AI model key.
    pub model_worst_case_cents: BTreeMap<String, i64>,

    /// Allowlisted operator ids for the control channel.
    pub operator_allowlist: Vec<i64>,

    /// HMAC-SHA256 hex signature over the canonical string.
    pub sig: String,
}

impl Manifest {
    /// Deterministic serialization of all signed fields, in fixed order.
    fn canonical_string(&self) -> String {
        let mut s = String::new();
        for (name, digest) in &self.artifacts {
            s.push_str(name);
            s.push('=');
            s.push_str(digest);
            s.push(';');
        }
        s.push_str(&format!(
            "client_order_id_max_len={};venue_tick={};taker_vol_sigma_max={};",
            self.client_order_id_max_len, self.venue_tick, self.taker_vol_sigma_max
        ));
        for (model, cents) in &self.model_worst_case_cents {
            s.push_str(&format!("model:{model}={cents};"));
        }
        for id in &self.operator_allowlist {
            s.push_str(&format!("op={id};"));
        }
        s
    }

    /// Compute the expected signature for this manifest with `secret`.
    pub fn compute_sig(&self, secret: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(self.canonical_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify the embedded signature. Comparison is constant time.
    pub fn verify_signature(&self, secret: &[u8]) -> bool {
        let expected = self.compute_sig(secret);
        constant_time_eq(expected.as_bytes(), self.sig.as_bytes())
    }

    /// Verify every covered artifact on disk against its pinned digest.
    /// Returns the first mismatching artifact path on failure.
    pub fn verify_artifacts(&self, base_dir: impl AsRef<Path>) -> Result<()> {
        let base = base_dir.as_ref();
        for (name, expected) in &self.artifacts {
            let path = base.join(name);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("manifest artifact unreadable: {}", path.display()))?;
            let digest = hex::encode(Sha256::digest(&bytes));
            if &digest != expected {
                anyhow::bail!("manifest artifact hash mismatch: {name}");
            }
        }
        Ok(())
    }

    /// Load and signature-verify the manifest in one step.
    pub fn load_verified(path: impl AsRef<Path>, secret: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest from {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse manifest from {}", path.display()))?;

        if !manifest.verify_signature(secret) {
            anyhow::bail!("manifest signature verification failed");
        }

        info!(
            path = %path.display(),
            artifacts = manifest.artifacts.len(),
            client_order_id_max_len = manifest.client_order_id_max_len,
            "signed manifest verified"
        );
        Ok(manifest)
    }
}

/// Compare two byte slices in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Verify that a secret file is not readable by group or world.
pub fn verify_secret_file_permissions(path: impl AsRef<Path>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = path.as_ref();
    let meta = std::fs::metadata(path)
        .with_context(|| format!("failed to stat secret file {}", path.display()))?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o044 != 0 {
        anyhow::bail!(
            "secret file {} is group/world readable (mode {:o})",
            path.display(),
            mode
        );
    }
    Ok(())
}
