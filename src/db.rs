//! SQLite connection shared by the credential store and the OAuth state cache.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Schema for all durable tables.
///
/// `idx_accounts_default` is a partial unique index: it serves the
/// "find default account" lookup and makes a second default row for the
/// same principal a constraint violation.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    principal TEXT NOT NULL,
    email TEXT NOT NULL,
    external_user_id TEXT NOT NULL,
    access_token TEXT NOT NULL,
    encrypted_refresh_token TEXT NOT NULL,
    expiry_date INTEGER NOT NULL,
    granted_scopes TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(principal, email)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_default
    ON accounts(principal) WHERE is_default = 1;

CREATE TABLE IF NOT EXISTS account_revocations (
    principal TEXT NOT NULL,
    email TEXT NOT NULL,
    revoked_at INTEGER NOT NULL,
    PRIMARY KEY (principal, email)
);

CREATE TABLE IF NOT EXISTS oauth_states (
    state_token TEXT PRIMARY KEY,
    principal TEXT NOT NULL,
    requested_scopes TEXT NOT NULL,
    pkce_verifier TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_oauth_states_expires_at
    ON oauth_states(expires_at);
"#;

/// Handle to the SQLite database.
///
/// Cloning is cheap; all clones share one connection. The mutex is held for
/// one statement or one transaction at a time and never across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) a database file and applies the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        debug!(path = %path.as_ref().display(), "Opened credential database");
        Self::init(conn)
    }

    /// Opens a private in-memory database (tests and ephemeral setups).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection for one unit of work.
    ///
    /// A panic while the lock was held cannot leave a half-applied
    /// transaction behind (dropping `Transaction` rolls back), so a poisoned
    /// lock is safe to reuse.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reads a millisecond timestamp column. Values chrono cannot represent
/// are reported as a conversion failure, never replaced.
pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailgate.db");

        Database::open(&path).unwrap();
        // Re-opening an existing file must not fail on CREATE statements
        let db = Database::open(&path).unwrap();

        let tables: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('accounts', 'account_revocations', 'oauth_states')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_second_default_rejected_by_index() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock();
        let insert = "INSERT INTO accounts (principal, email, external_user_id, access_token, encrypted_refresh_token, expiry_date, granted_scopes, is_default, created_at, updated_at) VALUES ('u1', ?1, 'x', 'a', 'r', 0, 'read', 1, 0, 0)";

        conn.execute(insert, ["a@example.com"]).unwrap();
        assert!(conn.execute(insert, ["b@example.com"]).is_err());
    }
}
