//! One-time OAuth state records for CSRF protection and PKCE binding.
//!
//! Records live in the `oauth_states` table so that any server instance
//! sharing the database can complete a flow started by another.

use super::pkce::generate_state_token;
use super::scope::{join_scopes, split_scopes, Scope};
use crate::db::{timestamp_column, Database};
use crate::error::{CredentialError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;

/// Pending authorization, keyed by its state token.
#[derive(Clone, Debug, PartialEq)]
pub struct OAuthState {
    pub state_token: String,
    pub principal: String,
    pub requested_scopes: BTreeSet<Scope>,
    pub pkce_verifier: String,
    pub expires_at: DateTime<Utc>,
}

/// Expiring, single-use store of [`OAuthState`] records.
#[derive(Clone)]
pub struct OAuthStateCache {
    db: Database,
    ttl: Duration,
}

impl OAuthStateCache {
    /// # Arguments
    /// * `ttl_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(db: Database, ttl_seconds: i64) -> Self {
        Self {
            db,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Creates and stores a new state with a fresh random token.
    pub fn issue(
        &self,
        principal: &str,
        requested_scopes: BTreeSet<Scope>,
        pkce_verifier: String,
    ) -> Result<OAuthState> {
        let state = OAuthState {
            state_token: generate_state_token(),
            principal: principal.to_string(),
            requested_scopes,
            pkce_verifier,
            expires_at: Utc::now() + self.ttl,
        };
        self.save(&state)?;
        Ok(state)
    }

    pub fn save(&self, state: &OAuthState) -> Result<()> {
        self.db.lock().execute(
            r#"
            INSERT INTO oauth_states (state_token, principal, requested_scopes, pkce_verifier, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                state.state_token,
                state.principal,
                join_scopes(&state.requested_scopes),
                state.pkce_verifier,
                state.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Removes and returns a state.
    ///
    /// The row is deleted by the same statement that reads it, so of two
    /// concurrent consumers only one can receive it. Expired rows are deleted
    /// as well but reported as `InvalidState`.
    pub fn consume(&self, state_token: &str) -> Result<OAuthState> {
        let row = self
            .db
            .lock()
            .query_row(
                r#"
                DELETE FROM oauth_states WHERE state_token = ?1
                RETURNING state_token, principal, requested_scopes, pkce_verifier, expires_at
                "#,
                params![state_token],
                |row| {
                    let scopes: String = row.get(2)?;
                    let requested_scopes = split_scopes(&scopes).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                    })?;

                    Ok(OAuthState {
                        state_token: row.get(0)?,
                        principal: row.get(1)?,
                        requested_scopes,
                        pkce_verifier: row.get(3)?,
                        expires_at: timestamp_column(row, 4)?,
                    })
                },
            )
            .optional()?;

        match row {
            Some(state) if state.expires_at > Utc::now() => Ok(state),
            _ => Err(CredentialError::InvalidState),
        }
    }

    /// Deletes expired, unconsumed states. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let removed = self.db.lock().execute(
            "DELETE FROM oauth_states WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Number of pending states (for debugging/monitoring)
    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.db
                .lock()
                .query_row("SELECT COUNT(*) FROM oauth_states", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Background task to periodically sweep expired states
///
/// A zero interval is treated as one second.
pub async fn run_state_sweep(cache: OAuthStateCache, interval_seconds: u64) {
    let period = tokio::time::Duration::from_secs(interval_seconds.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        match cache.sweep_expired() {
            Ok(removed) => tracing::debug!(removed, "OAuth state sweep complete"),
            Err(e) => tracing::error!(error = %e, "OAuth state sweep failed"),
        }
    }
}
