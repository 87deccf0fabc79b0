//! Durable ledger of settled authorization nonces.
//!
//! The ledger is the facilitator's replay barrier for the immediate path:
//! a nonce is claimed atomically before the on-chain submission, and a
//! claim that loses the race surfaces as `AlreadySettled`. Claims are
//! never released on failure: a submission that timed out may still
//! mine, and releasing would reopen the replay window.

use alloy::primitives::FixedBytes;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Storage backend for settled nonces. Implementations must be
/// thread-safe.
pub trait NonceLedger: Send + Sync {
    /// Whether this nonce has already been claimed by a settlement.
    fn is_settled(&self, nonce: &FixedBytes<32>) -> bool;

    /// Atomically claim the nonce. Returns `false` when it was already
    /// claimed (concurrent or replayed request).
    fn try_claim(&self, nonce: FixedBytes<32>) -> bool;

    /// Delete claims older than `max_age_secs`. Safe once the matching
    /// authorizations' `validBefore` has passed, because the window check
    /// rejects them anyway. Returns the number purged.
    fn purge_expired(&self, max_age_secs: u64) -> usize;
}

/// In-memory ledger. Claims are lost on restart, which reopens the replay
/// window; acceptable only in tests.
pub struct InMemoryNonceLedger {
    claims: DashMap<FixedBytes<32>, Instant>,
}

impl InMemoryNonceLedger {
    pub fn new() -> Self {
        Self {
            claims: DashMap::new(),
        }
    }
}

impl Default for InMemoryNonceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceLedger for InMemoryNonceLedger {
    fn is_settled(&self, nonce: &FixedBytes<32>) -> bool {
        self.claims.contains_key(nonce)
    }

    fn try_claim(&self, nonce: FixedBytes<32>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.claims.entry(nonce) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    fn purge_expired(&self, max_age_secs: u64) -> usize {
        let before = self.claims.len();
        self.claims
            .retain(|_, claimed| claimed.elapsed().as_secs() < max_age_secs);
        before - self.claims.len()
    }
}

/// SQLite-backed ledger. The PRIMARY KEY insert makes the claim atomic at
/// the database level, safe across processes.
pub struct SqliteNonceLedger {
    conn: Mutex<rusqlite::Connection>,
}

fn unix_now() -> i64 {
    // Fail-secure on clock error: i64::MAX survives any purge cutoff.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_else(|_| {
            tracing::error!("system clock before UNIX epoch; claims pinned to max timestamp");
            i64::MAX
        })
}

impl SqliteNonceLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settled_authorizations (
                nonce BLOB PRIMARY KEY,
                claimed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settled_claimed_at
                ON settled_authorizations(claimed_at);
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("nonce ledger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl NonceLedger for SqliteNonceLedger {
    fn is_settled(&self, nonce: &FixedBytes<32>) -> bool {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM settled_authorizations WHERE nonce = ?1",
                [nonce.as_slice()],
                |row| row.get(0),
            )
            // Fail-secure: a broken query reads as "already settled"
            .unwrap_or(1);
        count > 0
    }

    fn try_claim(&self, nonce: FixedBytes<32>) -> bool {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settled_authorizations (nonce, claimed_at) VALUES (?1, ?2)",
            rusqlite::params![nonce.as_slice(), unix_now()],
        )
        .is_ok()
    }

    fn purge_expired(&self, max_age_secs: u64) -> usize {
        let conn = self.conn();
        let cutoff = unix_now().saturating_sub(max_age_secs as i64);
        conn.execute(
            "DELETE FROM settled_authorizations WHERE claimed_at < ?1",
            rusqlite::params![cutoff],
        )
        .unwrap_or(0)
    }
}
