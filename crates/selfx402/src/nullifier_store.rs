//! Durable nullifier registry for Sybil-resistant identity gating.
//!
//! One real-world identity yields one nullifier per scope; a non-expired
//! (nullifier, scope) pair may exist at most once. Uniqueness lives in the
//! store's UNIQUE constraint so concurrent verifications race safely: the
//! loser's insert fails with `DuplicateNullifier` instead of silently
//! overwriting. Records expire after 90 days, after which the same
//! identity may verify again once cleanup has run.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::FacilitatorError;

/// Verification window of the upstream identity protocol.
pub const NULLIFIER_TTL_SECS: i64 = 90 * 24 * 60 * 60;

/// A consumed identity verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullifierRecord {
    pub id: String,
    pub nullifier: String,
    pub scope: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_id: Option<String>,
    pub nationality: Option<String>,
    /// Free-form disclosed-attribute metadata (JSON).
    pub metadata: String,
}

/// Per-scope registry statistics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ScopeStats {
    pub total: u64,
    pub active: u64,
    pub expired: u64,
}

/// SQLite-backed nullifier registry.
pub struct NullifierStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nullifiers (
    id TEXT PRIMARY KEY,
    nullifier TEXT NOT NULL,
    scope TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    user_id TEXT,
    nationality TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE(nullifier, scope)
);
CREATE INDEX IF NOT EXISTS idx_nullifiers_scope ON nullifiers(scope, expires_at);
";

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl NullifierStore {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &str) -> Result<Self, FacilitatorError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("nullifier store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Whether a non-expired record exists for (nullifier, scope).
    pub fn exists(&self, nullifier: &str, scope: &str) -> Result<bool, FacilitatorError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nullifiers
             WHERE nullifier = ?1 AND scope = ?2 AND expires_at > ?3",
            params![nullifier, scope, unix_now()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a consumed verification with a 90-day expiry.
    ///
    /// The INSERT against the UNIQUE constraint is the atomic
    /// check-then-store; a concurrent duplicate surfaces as
    /// [`FacilitatorError::DuplicateNullifier`].
    pub fn store(
        &self,
        nullifier: &str,
        scope: &str,
        user_id: Option<&str>,
        nationality: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<NullifierRecord, FacilitatorError> {
        let now = unix_now();
        let record = NullifierRecord {
            id: Uuid::new_v4().to_string(),
            nullifier: nullifier.to_string(),
            scope: scope.to_string(),
            created_at: now,
            expires_at: now + NULLIFIER_TTL_SECS,
            user_id: user_id.map(str::to_string),
            nationality: nationality.map(str::to_string),
            metadata: metadata.to_string(),
        };

        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO nullifiers
                (id, nullifier, scope, created_at, expires_at, user_id, nationality, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.nullifier,
                record.scope,
                record.created_at,
                record.expires_at,
                record.user_id,
                record.nationality,
                record.metadata,
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(
                    nullifier = %truncated(nullifier),
                    scope,
                    expires_at = record.expires_at,
                    "nullifier stored"
                );
                Ok(record)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!(
                    nullifier = %truncated(nullifier),
                    scope,
                    "duplicate nullifier rejected"
                );
                Err(FacilitatorError::DuplicateNullifier)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a record regardless of expiry.
    pub fn get(
        &self,
        nullifier: &str,
        scope: &str,
    ) -> Result<Option<NullifierRecord>, FacilitatorError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, nullifier, scope, created_at, expires_at, user_id, nationality, metadata
                 FROM nullifiers WHERE nullifier = ?1 AND scope = ?2",
                params![nullifier, scope],
                |row| {
                    Ok(NullifierRecord {
                        id: row.get(0)?,
                        nullifier: row.get(1)?,
                        scope: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                        user_id: row.get(5)?,
                        nationality: row.get(6)?,
                        metadata: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Delete records past expiry. Intended for a periodic job, not the
    /// request path. Returns the number deleted.
    pub fn cleanup_expired(&self) -> Result<usize, FacilitatorError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM nullifiers WHERE expires_at < ?1",
            params![unix_now()],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up expired nullifiers");
        }
        Ok(deleted)
    }

    /// Registry statistics for one scope.
    pub fn scope_stats(&self, scope: &str) -> Result<ScopeStats, FacilitatorError> {
        let conn = self.conn();
        let now = unix_now();
        let (total, active): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(expires_at > ?2), 0)
             FROM nullifiers WHERE scope = ?1",
            params![scope, now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ScopeStats {
            total: total as u64,
            active: active as u64,
            expired: (total - active) as u64,
        })
    }

    #[cfg(test)]
    fn force_expiry(&self, nullifier: &str, scope: &str) {
        let conn = self.conn();
        conn.execute(
            "UPDATE nullifiers SET expires_at = 1 WHERE nullifier = ?1 AND scope = ?2",
            params![nullifier, scope],
        )
        .unwrap();
    }
}

fn truncated(nullifier: &str) -> &str {
    &nullifier[..nullifier.len().min(10)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, NullifierStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nullifiers.db");
        let store = NullifierStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn store_then_exists() {
        let (_dir, store) = open_store();
        assert!(!store.exists("n1", "marketplace").unwrap());

        store
            .store("n1", "marketplace", Some("u1"), Some("FRA"), &serde_json::json!({}))
            .unwrap();
        assert!(store.exists("n1", "marketplace").unwrap());
    }

    #[test]
    fn same_nullifier_different_scope_allowed() {
        let (_dir, store) = open_store();
        store.store("n1", "scope-a", None, None, &serde_json::json!({})).unwrap();
        store.store("n1", "scope-b", None, None, &serde_json::json!({})).unwrap();
        assert!(store.exists("n1", "scope-a").unwrap());
        assert!(store.exists("n1", "scope-b").unwrap());
    }

    #[test]
    fn duplicate_rejected_until_expiry_and_cleanup() {
        let (_dir, store) = open_store();
        let meta = serde_json::json!({"ageValid": true});

        store.store("n1", "marketplace", None, None, &meta).unwrap();

        // Second store fails on the unique constraint
        let second = store.store("n1", "marketplace", None, None, &meta);
        assert!(matches!(second, Err(FacilitatorError::DuplicateNullifier)));

        // Expired records no longer count as existing, but the row still
        // blocks re-insert until cleanup removes it
        store.force_expiry("n1", "marketplace");
        assert!(!store.exists("n1", "marketplace").unwrap());
        assert_eq!(store.cleanup_expired().unwrap(), 1);

        // Third store succeeds: the identity may re-verify
        store.store("n1", "marketplace", None, None, &meta).unwrap();
        assert!(store.exists("n1", "marketplace").unwrap());
    }

    #[test]
    fn get_returns_disclosed_metadata() {
        let (_dir, store) = open_store();
        let meta = serde_json::json!({"ageValid": true, "ofacValid": false});
        store
            .store("n9", "marketplace", Some("user-9"), Some("DEU"), &meta)
            .unwrap();

        let record = store.get("n9", "marketplace").unwrap().unwrap();
        assert_eq!(record.nationality.as_deref(), Some("DEU"));
        assert_eq!(record.user_id.as_deref(), Some("user-9"));
        let parsed: serde_json::Value = serde_json::from_str(&record.metadata).unwrap();
        assert_eq!(parsed["ageValid"], true);
        assert_eq!(record.expires_at - record.created_at, NULLIFIER_TTL_SECS);
    }

    #[test]
    fn scope_stats_split_active_and_expired() {
        let (_dir, store) = open_store();
        store.store("n1", "s", None, None, &serde_json::json!({})).unwrap();
        store.store("n2", "s", None, None, &serde_json::json!({})).unwrap();
        store.force_expiry("n2", "s");

        let stats = store.scope_stats("s").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.expired, 1);
    }
}
