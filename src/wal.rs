// =============================================================================
// Durability Log (WAL) — append-only, fsync per record, deterministic replay
// =============================================================================
//
// Every record is one JSON line. Offsets are assigned sequentially at append
// time and re-verified on replay; a gap, an out-of-order offset, or an
// unparseable line is a replay failure and the caller must HALT.
//
// LIVE submits follow the two-phase discipline: ORDER_INTENT is written and
// fsynced here BEFORE the network request, ORDER_RESULT after. PAPER entries
// are never written to the WAL.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Cents, CoreError, OrderStatus, Side};

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Kinds of durable records. CANCEL/ORDER intents exist for LIVE only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    StateChanged,
    OrderIntent,
    OrderIntentAborted,
    OrderResult,
    CancelIntent,
    CancelResult,
}

/// One durable WAL record. `offset` is the total-order key used on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub offset: u64,
    pub ts_ms: i64,
    pub kind: WalRecordKind,
    pub payload: serde_json::Value,
}

/// Payload of STATE_CHANGED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedRecord {
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// Payload of ORDER_INTENT / ORDER_INTENT_ABORTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntentRecord {
    pub client_order_id: String,
    pub decision_id: String,
    pub market_id: String,
    pub side: Side,
    pub price_micros: i64,
    pub size_cents: Cents,
}

/// Payload of ORDER_RESULT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResultRecord {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub filled_cents: Cents,
}

/// Payload of CANCEL_INTENT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelIntentRecord {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
}

/// Payload of CANCEL_RESULT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResultRecord {
    pub client_order_id: String,
    /// "CONFIRMED", "ABSENT", or "AMBIGUOUS".
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// WAL writer
// ---------------------------------------------------------------------------

struct WalInner {
    file: File,
    next_offset: u64,
}

/// Single-writer append-only log. All appends go through one file-level
/// mutex; each record is fsynced before the append returns.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the WAL at `path`. Existing records are scanned to
    /// establish the next offset; a corrupt tail is an open failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_offset = if path.exists() {
            let records = Self::read_all(&path)?;
            records.last().map(|r| r.offset + 1).unwrap_or(0)
        } else {
            0
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open WAL at {}", path.display()))?;

        info!(path = %path.display(), next_offset, "WAL opened");

        Ok(Self {
            path,
            inner: Mutex::new(WalInner { file, next_offset }),
        })
    }

    /// Append one record and fsync. Returns the assigned offset.
    ///
    /// An error here means the record may not be durable; the caller must
    /// treat it as a WAL_DEGRADED condition and fail closed.
    pub fn append(
        &self,
        kind: WalRecordKind,
        payload: &impl Serialize,
        ts_ms: i64,
    ) -> Result<u64> {
        let payload =
            serde_json::to_value(payload).context("failed to serialise WAL payload")?;

        let mut inner = self.inner.lock();
        let offset = inner.next_offset;
        let record = WalRecord {
            offset,
            ts_ms,
            kind,
            payload,
        };

        let mut line = serde_json::to_string(&record).context("failed to serialise WAL record")?;
        line.push('\n');

        inner
            .file
            .write_all(line.as_bytes())
            .map_err(|e| CoreError::PersistenceWrite(format!("WAL write: {e}")))?;
        inner
            .file
            .sync_all()
            .map_err(|e| CoreError::PersistenceWrite(format!("WAL fsync: {e}")))?;
        inner.next_offset = offset + 1;

        Ok(offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record in offset order. Any gap, reordering, or parse
    /// failure is an error — replay is all-or-nothing.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<WalRecord>> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open WAL for replay at {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.context("WAL read failed")?;
            if line.trim().is_empty() {
                continue;
            }
            let record: WalRecord = serde_json::from_str(&line)
                .with_context(|| format!("corrupt WAL record at line {}", line_no + 1))?;
            let expected = records.len() as u64;
            if record.offset != expected {
                anyhow::bail!(
                    "WAL offset discontinuity at line {}: expected {}, found {}",
                    line_no + 1,
                    expected,
                    record.offset
                );
            }
            records.push(record);
        }

        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Orphan detection
// ---------------------------------------------------------------------------

/// Scan replayed records for ORDER_INTENTs with no corresponding
/// ORDER_RESULT or ORDER_INTENT_ABORTED. These are submits whose outcome
/// the process never learned; they must be adopted as PENDING_UNKNOWN and
/// enqueued for reconciliation.
pub fn orphaned_intents(records: &[WalRecord]) -> Vec<OrderIntentRecord> {
    use std::collections::HashMap;

    let mut intents: HashMap<String, OrderIntentRecord> = HashMap::new();
    let mut closed: std::collections::HashSet<String> = std::collections::HashSet::new();

    for record in records {
        match record.kind {
            WalRecordKind::OrderIntent => {
                match serde_json::from_value::<OrderIntentRecord>(record.payload.clone()) {
                    Ok(intent) => {
                        intents.insert(intent.client_order_id.clone(), intent);
                    }
                    Err(e) => warn!(offset = record.offset, error = %e, "unreadable ORDER_INTENT payload"),
                }
            }
            WalRecordKind::OrderIntentAborted => {
                if let Some(id) = record.payload.get("client_order_id").and_then(|v| v.as_str()) {
                    closed.insert(id.to_string());
                }
            }
            WalRecordKind::OrderResult => {
                if let Some(id) = record.payload.get("client_order_id").and_then(|v| v.as_str()) {
                    closed.insert(id.to_string());
                }
            }
            _ => {}
        }
    }

    let mut orphans: Vec<OrderIntentRecord> = intents
        .into_iter()
        .filter(|(id, _)| !closed.contains(id))
        .map(|(_, intent)| intent)
        .collect();
    orphans.sort_by(|a, b| a.client_order_id.cmp(&b.client_order_id));
    orphans
}
