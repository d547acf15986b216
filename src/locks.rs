// =============================================================================
// Lock Manager — leased per-market locks with versioning and steal grace
// =============================================================================
//
// One lock row per market. A lock is acquirable when no row exists, when the
// lease expired at least the steal grace ago, or when the owner heartbeat is
// older than twice the TTL. Every acquire and every renewal bumps
// `lock_version`; the version recorded at decision time is compared against
// the row immediately before the network submit, so any ownership change in
// between aborts the submit.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;
use tracing::{debug, warn};

use crate::event_store::EventStore;

/// Lease duration applied on acquire and renew.
pub const LOCK_TTL_MS: i64 = 60_000;
/// Renewal cadence for holders.
pub const LOCK_RENEW_INTERVAL_MS: i64 = 10_000;
/// An expired lease may only be stolen after this grace period.
pub const LOCK_STEAL_GRACE_MS: i64 = 5_000;

/// Proof of lock ownership handed to the holder. The version is the
/// holder's view and must match the row at the pre-exec gate.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHandle {
    pub market_id: String,
    pub lock_version: i64,
    pub expires_at_ms: i64,
}

/// Raw lock row, used by the gate recheck and tests.
#[derive(Debug, Clone)]
pub struct LockRow {
    pub market_id: String,
    pub owner_instance: String,
    pub owner_worker: String,
    pub lock_version: i64,
    pub owner_heartbeat_ms: i64,
    pub expires_at_ms: i64,
    pub last_renewed_ms: i64,
}

/// Leased-lock coordinator over the `market_locks` table.
pub struct LockManager {
    store: EventStore,
    instance_id: String,
}

impl LockManager {
    pub fn new(store: EventStore, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    /// Attempt to acquire the market lock for `worker`. Returns None when
    /// another live owner holds it.
    pub fn acquire(
        &self,
        market_id: &str,
        worker: &str,
        now_ms: i64,
    ) -> Result<Option<LockHandle>> {
        let instance = self.instance_id.clone();
        let market = market_id.to_string();
        let worker = worker.to_string();

        self.store.with_tx(move |tx| {
            let existing: Option<LockRow> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT market_id, owner_instance, owner_worker, lock_version,
                            owner_heartbeat_ms, expires_at_ms, last_renewed_ms
                     FROM market_locks WHERE market_id = ?1",
                )?;
                let mut rows = stmt.query(params![market])?;
                match rows.next()? {
                    Some(row) => Some(LockRow {
                        market_id: row.get(0)?,
                        owner_instance: row.get(1)?,
                        owner_worker: row.get(2)?,
                        lock_version: row.get(3)?,
                        owner_heartbeat_ms: row.get(4)?,
                        expires_at_ms: row.get(5)?,
                        last_renewed_ms: row.get(6)?,
                    }),
                    None => None,
                }
            };

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO market_locks
                            (market_id, owner_instance, owner_worker, lock_version,
                             owner_heartbeat_ms, expires_at_ms, last_renewed_ms)
                         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?4)",
                        params![market, instance, worker, now_ms, now_ms + LOCK_TTL_MS],
                    )
                    .context("insert lock row")?;
                    debug!(market = %market, worker = %worker, "lock acquired (fresh)");
                    Ok(Some(LockHandle {
                        market_id: market,
                        lock_version: 1,
                        expires_at_ms: now_ms + LOCK_TTL_MS,
                    }))
                }
                Some(row) => {
                    let same_owner =
                        row.owner_instance == instance && row.owner_worker == worker;
                    let expired_past_grace =
                        now_ms - row.expires_at_ms >= LOCK_STEAL_GRACE_MS;
                    let heartbeat_dead =
                        row.owner_heartbeat_ms < now_ms - 2 * LOCK_TTL_MS;

                    if !(same_owner || expired_past_grace || heartbeat_dead) {
                        return Ok(None);
                    }

                    let new_version = row.lock_version + 1;
                    tx.execute(
                        "UPDATE market_locks SET
                            owner_instance = ?2, owner_worker = ?3, lock_version = ?4,
                            owner_heartbeat_ms = ?5, expires_at_ms = ?6, last_renewed_ms = ?5
                         WHERE market_id = ?1",
                        params![
                            market,
                            instance,
                            worker,
                            new_version,
                            now_ms,
                            now_ms + LOCK_TTL_MS
                        ],
                    )
                    .context("takeover lock row")?;

                    if !same_owner {
                        warn!(
                            market = %market,
                            previous_owner = %row.owner_worker,
                            new_worker = %worker,
                            "stale lock stolen"
                        );
                    }

                    Ok(Some(LockHandle {
                        market_id: market,
                        lock_version: new_version,
                        expires_at_ms: now_ms + LOCK_TTL_MS,
                    }))
                }
            }
        })
    }

    /// Renew a held lock. Bumps the version; fails (None) when the row no
    /// longer matches the holder's version — i.e. the lock was lost.
    pub fn renew(
        &self,
        handle: &LockHandle,
        worker: &str,
        now_ms: i64,
    ) -> Result<Option<LockHandle>> {
        let instance = self.instance_id.clone();
        let market = handle.market_id.clone();
        let version = handle.lock_version;
        let worker = worker.to_string();

        self.store.with_tx(move |tx| {
            let updated = tx.execute(
                "UPDATE market_locks SET
                    lock_version = lock_version + 1,
                    owner_heartbeat_ms = ?4,
                    expires_at_ms = ?5,
                    last_renewed_ms = ?4
                 WHERE market_id = ?1 AND owner_instance = ?2 AND owner_worker = ?3
                   AND lock_version = ?6",
                params![market, instance, worker, now_ms, now_ms + LOCK_TTL_MS, version],
            )?;

            if updated == 0 {
                return Ok(None);
            }
            Ok(Some(LockHandle {
                market_id: market,
                lock_version: version + 1,
                expires_at_ms: now_ms + LOCK_TTL_MS,
            }))
        })
    }

    /// Release a held lock (row deleted only when still owned).
    pub fn release(&self, handle: &LockHandle, worker: &str) -> Result<()> {
        let instance = self.instance_id.clone();
        let market = handle.market_id.clone();
        let version = handle.lock_version;
        let worker = worker.to_string();

        self.store.with_tx(move |tx| {
            tx.execute(
                "DELETE FROM market_locks
                 WHERE market_id = ?1 AND owner_instance = ?2 AND owner_worker = ?3
                   AND lock_version = ?4",
                params![market, instance, worker, version],
            )?;
            Ok(())
        })
    }

    /// Read the current row, if any.
    pub fn get(&self, market_id: &str) -> Result<Option<LockRow>> {
        let market = market_id.to_string();
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, owner_instance, owner_worker, lock_version,
                        owner_heartbeat_ms, expires_at_ms, last_renewed_ms
                 FROM market_locks WHERE market_id = ?1",
            )?;
            let mut rows = stmt.query(params![market])?;
            match rows.next()? {
                Some(row) => Ok(Some(LockRow {
                    market_id: row.get(0)?,
                    owner_instance: row.get(1)?,
                    owner_worker: row.get(2)?,
                    lock_version: row.get(3)?,
                    owner_heartbeat_ms: row.get(4)?,
                    expires_at_ms: row.get(5)?,
                    last_renewed_ms: row.get(6)?,
                })),
                None => Ok(None),
            }
        })
    }

    /// Current row version, used by the pre-exec gate recheck.
    pub fn current_version(&self, market_id: &str) -> Result<Option<i64>> {
        Ok(self.get(market_id)?.map(|row| row.lock_version))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(instance: &str) -> LockManager {
        LockManager::new(EventStore::open_in_memory().unwrap(), instance)
    }

    #[test]
    fn fresh_acquire_starts_at_version_one() {
        let lm = manager("inst-a");
        let handle = lm.acquire("mkt-1", "w1", 1_000).unwrap().unwrap();
        assert_eq!(handle.lock_version, 1);
        assert_eq!(handle.expires_at_ms, 1_000 + LOCK_TTL_MS);
    }

    #[test]
    fn contended_acquire_fails_while_lease_live() {
        let store = EventStore::open_in_memory().unwrap();
        let a = LockManager::new(store.clone(), "inst-a");
        let b = LockManager::new(store, "inst-b");

        a.acquire("mkt-1", "w1", 1_000).unwrap().unwrap();
        assert!(b.acquire("mkt-1", "w1", 2_000).unwrap().is_none());
    }

    #[test]
    fn steal_requires_expiry_plus_grace() {
        let store = EventStore::open_in_memory().unwrap();
        let a = LockManager::new(store.clone(), "inst-a");
        let b = LockManager::new(store, "inst-b");

        let h = a.acquire("mkt-1", "w1", 0).unwrap().unwrap();
        let expiry = h.expires_at_ms;

        // Expired but inside the grace period: not stealable.
        assert!(b
            .acquire("mkt-1", "w2", expiry + LOCK_STEAL_GRACE_MS - 1)
            .unwrap()
            .is_none());

        // At expiry + grace: stealable, version bumps.
        let stolen = b
            .acquire("mkt-1", "w2", expiry + LOCK_STEAL_GRACE_MS)
            .unwrap()
            .unwrap();
        assert_eq!(stolen.lock_version, 2);
    }

    #[test]
    fn dead_heartbeat_allows_takeover() {
        let store = EventStore::open_in_memory().unwrap();
        let a = LockManager::new(store.clone(), "inst-a");
        let b = LockManager::new(store, "inst-b");

        a.acquire("mkt-1", "w1", 0).unwrap().unwrap();
        // Heartbeat (0) older than now - 2*TTL.
        let now = 2 * LOCK_TTL_MS + 1;
        let stolen = b.acquire("mkt-1", "w2", now).unwrap();
        assert!(stolen.is_some());
    }

    #[test]
    fn renew_bumps_version_and_extends_lease() {
        let lm = manager("inst-a");
        let h = lm.acquire("mkt-1", "w1", 1_000).unwrap().unwrap();
        let renewed = lm.renew(&h, "w1", 11_000).unwrap().unwrap();
        assert_eq!(renewed.lock_version, 2);
        assert_eq!(renewed.expires_at_ms, 11_000 + LOCK_TTL_MS);

        // Renewing with the stale handle now fails: the lock moved on.
        assert!(lm.renew(&h, "w1", 12_000).unwrap().is_none());
    }

    #[test]
    fn gate_version_recheck_detects_takeover() {
        let store = EventStore::open_in_memory().unwrap();
        let a = LockManager::new(store.clone(), "inst-a");
        let b = LockManager::new(store, "inst-b");

        let h = a.acquire("mkt-1", "w1", 0).unwrap().unwrap();
        assert_eq!(a.current_version("mkt-1").unwrap(), Some(h.lock_version));

        let now = h.expires_at_ms + LOCK_STEAL_GRACE_MS;
        b.acquire("mkt-1", "w2", now).unwrap().unwrap();

        // Decision-time version no longer matches the row.
        assert_ne!(a.current_version("mkt-1").unwrap(), Some(h.lock_version));
    }

    #[test]
    fn release_removes_owned_row_only() {
        let lm = manager("inst-a");
        let h = lm.acquire("mkt-1", "w1", 0).unwrap().unwrap();
        lm.release(&h, "w1").unwrap();
        assert!(lm.get("mkt-1").unwrap().is_none());

        // Releasing with a stale handle is a no-op.
        let h2 = lm.acquire("mkt-1", "w1", 0).unwrap().unwrap();
        let stale = LockHandle {
            lock_version: h2.lock_version + 5,
            ..h2.clone()
        };
        lm.release(&stale, "w1").unwrap();
        assert!(lm.get("mkt-1").unwrap().is_some());
    }
}
