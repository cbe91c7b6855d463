//! Account repository backed by SQLite.
//!
//! Enforces the single-default invariant: a principal with at least one
//! account has exactly one account flagged default. Every mutation that can
//! touch more than one row runs in a single immediate transaction and checks
//! the invariant before committing.

use super::{normalize_email, Account, NewAccount, UpsertOutcome};
use crate::db::{timestamp_column, Database};
use crate::error::{CredentialError, Result};
use crate::oauth::scope::{join_scopes, split_scopes};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use tracing::{debug, error, info, warn};


const ACCOUNT_COLUMNS: &str = "principal, external_user_id, email, access_token, \
     encrypted_refresh_token, expiry_date, granted_scopes, is_default, created_at, updated_at";

/// Persistent store of connected accounts.
///
/// # Schema
/// ```sql
/// CREATE TABLE accounts (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,  -- connection order tiebreak
///     principal TEXT NOT NULL,
///     email TEXT NOT NULL,                   -- normalized
///     external_user_id TEXT NOT NULL,
///     access_token TEXT NOT NULL,
///     encrypted_refresh_token TEXT NOT NULL, -- AES-256-GCM, base64
///     expiry_date INTEGER NOT NULL,          -- epoch ms
///     granted_scopes TEXT NOT NULL,          -- space separated scope names
///     is_default INTEGER NOT NULL DEFAULT 0,
///     created_at INTEGER NOT NULL,           -- epoch ms
///     updated_at INTEGER NOT NULL,           -- epoch ms
///     UNIQUE(principal, email)
/// );
/// ```
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
}

impl CredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Opens a store on its own database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    /// Looks up an account.
    ///
    /// With `email = None` the default account is returned. If no account is
    /// flagged default (which the invariant forbids) the most recently updated
    /// account is returned and the anomaly is logged; use
    /// [`check_invariant`](Self::check_invariant) to surface it as an error.
    pub fn get(&self, principal: &str, email: Option<&str>) -> Result<Account> {
        let conn = self.db.lock();

        match email {
            Some(email) => {
                let email = normalize_email(email);
                if let Some(account) = find_account(&conn, principal, &email)? {
                    return Ok(account);
                }
                if is_revoked(&conn, principal, &email)? {
                    return Err(CredentialError::AccountRevoked { email });
                }
                Err(CredentialError::AccountNotFound { email })
            }
            None => {
                if let Some(account) = find_default(&conn, principal)? {
                    return Ok(account);
                }

                let fallback = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM accounts WHERE principal = ?1 \
                             ORDER BY updated_at DESC, id DESC LIMIT 1",
                            ACCOUNT_COLUMNS
                        ),
                        params![principal],
                        row_to_account,
                    )
                    .optional()?;

                if let Some(account) = fallback {
                    error!(
                        principal = %principal,
                        email = %account.email,
                        invariant_violation = true,
                        "No default account flagged; falling back to most recently updated"
                    );
                    return Ok(account);
                }

                match latest_revocation(&conn, principal)? {
                    Some(email) => Err(CredentialError::AccountRevoked { email }),
                    None => Err(CredentialError::NotConnected),
                }
            }
        }
    }

    /// Lists a principal's accounts: default first, then connection order.
    pub fn list(&self, principal: &str) -> Result<Vec<Account>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts WHERE principal = ?1 \
             ORDER BY is_default DESC, created_at ASC, id ASC",
            ACCOUNT_COLUMNS
        ))?;

        let accounts = stmt
            .query_map(params![principal], row_to_account)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(accounts)
    }

    /// Inserts a new account or replaces the tokens of an existing one.
    ///
    /// Default handling:
    /// - first account of a principal: always default
    /// - new account with siblings: default only if `make_default == Some(true)`
    /// - reconnect: default flag preserved unless `make_default` is `Some`
    ///
    /// Reconnecting also clears any revocation recorded for the account.
    pub fn upsert(&self, account: NewAccount, make_default: Option<bool>) -> Result<UpsertOutcome> {
        let principal = account.principal.as_str();
        let email = normalize_email(&account.email);
        let now = Utc::now().timestamp_millis();

        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = find_account(&tx, principal, &email)?;
        let reconnected = existing.is_some();

        match existing {
            Some(previous) => {
                tx.execute(
                    r#"
                    UPDATE accounts SET
                        external_user_id = ?3,
                        access_token = ?4,
                        encrypted_refresh_token = ?5,
                        expiry_date = ?6,
                        granted_scopes = ?7,
                        updated_at = ?8
                    WHERE principal = ?1 AND email = ?2
                    "#,
                    params![
                        principal,
                        email,
                        account.external_user_id,
                        account.access_token,
                        account.encrypted_refresh_token,
                        account.expiry_date.timestamp_millis(),
                        join_scopes(&account.granted_scopes),
                        now,
                    ],
                )?;

                match make_default {
                    Some(true) if !previous.is_default => promote(&tx, principal, &email)?,
                    Some(false) if previous.is_default => demote(&tx, principal, &email)?,
                    _ => {}
                }
            }
            None => {
                let prior = count_accounts(&tx, principal)?;
                let is_default = prior == 0 || make_default == Some(true);

                if is_default && prior > 0 {
                    tx.execute(
                        "UPDATE accounts SET is_default = 0 WHERE principal = ?1 AND is_default = 1",
                        params![principal],
                    )?;
                }

                tx.execute(
                    &format!(
                        "INSERT INTO accounts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                        ACCOUNT_COLUMNS
                    ),
                    params![
                        principal,
                        account.external_user_id,
                        email,
                        account.access_token,
                        account.encrypted_refresh_token,
                        account.expiry_date.timestamp_millis(),
                        join_scopes(&account.granted_scopes),
                        is_default,
                        now,
                    ],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM account_revocations WHERE principal = ?1 AND email = ?2",
            params![principal, email],
        )?;

        ensure_single_default(&tx, principal)?;

        let stored = find_account(&tx, principal, &email)?.ok_or_else(|| {
            CredentialError::InvariantViolation(format!("account {} vanished during upsert", email))
        })?;
        let account_count = count_accounts(&tx, principal)?;

        tx.commit()?;

        info!(
            principal = %principal,
            email = %email,
            reconnected,
            is_default = stored.is_default,
            account_count,
            "Account stored"
        );

        Ok(UpsertOutcome {
            account: stored,
            reconnected,
            account_count,
        })
    }

    /// Stores a refreshed access token, provided the account still holds
    /// `used_refresh_token` (the encrypted token the refresh was made with).
    ///
    /// Returns `None` when the account was reconnected in the meantime; the
    /// newer credentials are left untouched. The refresh token itself is
    /// only replaced when the provider rotated it.
    pub fn update_tokens(
        &self,
        principal: &str,
        email: &str,
        used_refresh_token: &str,
        access_token: &str,
        expiry_date: DateTime<Utc>,
        rotated_refresh_token: Option<&str>,
    ) -> Result<Option<Account>> {
        let email = normalize_email(email);
        let conn = self.db.lock();

        let updated = conn.execute(
            r#"
            UPDATE accounts SET
                access_token = ?3,
                expiry_date = ?4,
                encrypted_refresh_token = COALESCE(?5, encrypted_refresh_token),
                updated_at = ?6
            WHERE principal = ?1 AND email = ?2 AND encrypted_refresh_token = ?7
            "#,
            params![
                principal,
                email,
                access_token,
                expiry_date.timestamp_millis(),
                rotated_refresh_token,
                Utc::now().timestamp_millis(),
                used_refresh_token,
            ],
        )?;

        if updated == 0 {
            return match find_account(&conn, principal, &email)? {
                Some(_) => {
                    debug!(principal = %principal, email = %email, "Account reconnected during refresh; keeping newer tokens");
                    Ok(None)
                }
                None => Err(CredentialError::AccountNotFound { email }),
            };
        }

        debug!(
            principal = %principal,
            email = %email,
            rotated = rotated_refresh_token.is_some(),
            "Access token updated"
        );

        find_account(&conn, principal, &email)
    }

    /// Makes `email` the principal's default account.
    pub fn set_default(&self, principal: &str, email: &str) -> Result<Account> {
        let email = normalize_email(email);
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_account(&tx, principal, &email)?.is_none() {
            if is_revoked(&tx, principal, &email)? {
                return Err(CredentialError::AccountRevoked { email });
            }
            return Err(CredentialError::AccountNotFound { email });
        }

        promote(&tx, principal, &email)?;
        ensure_single_default(&tx, principal)?;

        let account = find_account(&tx, principal, &email)?
            .ok_or_else(|| CredentialError::AccountNotFound { email: email.clone() })?;
        tx.commit()?;

        info!(principal = %principal, email = %email, "Default account changed");
        Ok(account)
    }

    /// Deletes one account, or all of the principal's accounts when `email`
    /// is `None`. Returns the number of rows removed.
    ///
    /// Removing the default promotes the oldest remaining account.
    pub fn delete(&self, principal: &str, email: Option<&str>) -> Result<usize> {
        let mut conn = self.db.lock();

        let Some(email) = email else {
            let removed = conn.execute(
                "DELETE FROM accounts WHERE principal = ?1",
                params![principal],
            )?;
            info!(principal = %principal, removed, "All accounts deleted");
            return Ok(removed);
        };

        let email = normalize_email(email);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = delete_and_promote(&tx, principal, &email, None)?;
        tx.commit()?;

        if removed > 0 {
            info!(principal = %principal, email = %email, "Account deleted");
        }
        Ok(removed)
    }

    /// Removes an account whose grant the provider revoked and records the
    /// revocation so later lookups report it.
    ///
    /// Only a row still holding `revoked_refresh_token` is removed. Returns
    /// `false`, changing nothing, when the account has since been
    /// reconnected or deleted.
    pub fn revoke(&self, principal: &str, email: &str, revoked_refresh_token: &str) -> Result<bool> {
        let email = normalize_email(email);
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = delete_and_promote(&tx, principal, &email, Some(revoked_refresh_token))?;
        if removed == 0 {
            debug!(principal = %principal, email = %email, "Revoked refresh token no longer stored");
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO account_revocations (principal, email, revoked_at) VALUES (?1, ?2, ?3)",
            params![principal, email, Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;

        warn!(principal = %principal, email = %email, "Account revoked by provider and removed");
        Ok(true)
    }

    /// Fails with `InvariantViolation` unless the principal has no accounts
    /// or exactly one default.
    pub fn check_invariant(&self, principal: &str) -> Result<()> {
        ensure_single_default(&self.db.lock(), principal)
    }
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let scopes: String = row.get(6)?;
    let granted_scopes = split_scopes(&scopes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(Account {
        principal: row.get(0)?,
        external_user_id: row.get(1)?,
        email: row.get(2)?,
        access_token: row.get(3)?,
        encrypted_refresh_token: row.get(4)?,
        expiry_date: timestamp_column(row, 5)?,
        granted_scopes,
        is_default: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

fn find_account(conn: &Connection, principal: &str, email: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!(
                "SELECT {} FROM accounts WHERE principal = ?1 AND email = ?2",
                ACCOUNT_COLUMNS
            ),
            params![principal, email],
            row_to_account,
        )
        .optional()?;
    Ok(account)
}

fn find_default(conn: &Connection, principal: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!(
                "SELECT {} FROM accounts WHERE principal = ?1 AND is_default = 1",
                ACCOUNT_COLUMNS
            ),
            params![principal],
            row_to_account,
        )
        .optional()?;
    Ok(account)
}

fn count_accounts(conn: &Connection, principal: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM accounts WHERE principal = ?1",
        params![principal],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn is_revoked(conn: &Connection, principal: &str, email: &str) -> Result<bool> {
    let revoked = conn
        .query_row(
            "SELECT 1 FROM account_revocations WHERE principal = ?1 AND email = ?2",
            params![principal, email],
            |_| Ok(()),
        )
        .optional()?;
    Ok(revoked.is_some())
}

fn latest_revocation(conn: &Connection, principal: &str) -> Result<Option<String>> {
    let email = conn
        .query_row(
            "SELECT email FROM account_revocations WHERE principal = ?1 \
             ORDER BY revoked_at DESC LIMIT 1",
            params![principal],
            |row| row.get(0),
        )
        .optional()?;
    Ok(email)
}

/// Flags `email` default and clears every sibling. Siblings are cleared
/// first so the partial unique index never sees two defaults.
fn promote(conn: &Connection, principal: &str, email: &str) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET is_default = 0 WHERE principal = ?1 AND email != ?2 AND is_default = 1",
        params![principal, email],
    )?;
    conn.execute(
        "UPDATE accounts SET is_default = 1 WHERE principal = ?1 AND email = ?2",
        params![principal, email],
    )?;
    Ok(())
}

/// Hands the default flag from `email` to the oldest sibling. A sole
/// account keeps the flag.
fn demote(conn: &Connection, principal: &str, email: &str) -> Result<()> {
    let successor: Option<String> = conn
        .query_row(
            "SELECT email FROM accounts WHERE principal = ?1 AND email != ?2 \
             ORDER BY created_at ASC, id ASC LIMIT 1",
            params![principal, email],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(successor) = successor {
        promote(conn, principal, &successor)?;
    }
    Ok(())
}

/// Deletes one account and, if it was the default, promotes the oldest
/// remaining account. With `refresh_token` set, only a row holding that
/// encrypted token matches. Caller owns the transaction.
fn delete_and_promote(
    conn: &Connection,
    principal: &str,
    email: &str,
    refresh_token: Option<&str>,
) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM accounts WHERE principal = ?1 AND email = ?2 \
         AND (?3 IS NULL OR encrypted_refresh_token = ?3)",
        params![principal, email, refresh_token],
    )?;

    if removed > 0 && find_default(conn, principal)?.is_none() {
        let oldest: Option<String> = conn
            .query_row(
                "SELECT email FROM accounts WHERE principal = ?1 \
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                params![principal],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(oldest) = oldest {
            conn.execute(
                "UPDATE accounts SET is_default = 1 WHERE principal = ?1 AND email = ?2",
                params![principal, oldest],
            )?;
            debug!(principal = %principal, email = %oldest, "Promoted oldest account to default");
        }
    }

    ensure_single_default(conn, principal)?;
    Ok(removed)
}

fn ensure_single_default(conn: &Connection, principal: &str) -> Result<()> {
    let (accounts, defaults): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_default), 0) FROM accounts WHERE principal = ?1",
        params![principal],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if accounts > 0 && defaults != 1 {
        return Err(CredentialError::InvariantViolation(format!(
            "principal {} has {} accounts and {} defaults",
            principal, accounts, defaults
        )));
    }
    Ok(())
}
