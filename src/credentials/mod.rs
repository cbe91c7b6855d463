//! Durable, encrypted credential storage for connected accounts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - per-(principal, email) accounts       │
//! │  - single-default invariant              │
//! │  - one transaction per mutation          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - refresh tokens encrypted by caller    │
//! │  - partial unique index on default       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The store never sees plaintext refresh tokens. Callers encrypt with
//! [`encrypt`] before [`CredentialStore::upsert`] and decrypt with
//! [`decrypt`] when they need to call the provider.
//!
//! # Usage
//!
//! ```no_run
//! use mailgate::credentials::{encrypt, CredentialStore, EncryptionKey, NewAccount};
//! use mailgate::db::Database;
//! use mailgate::oauth::Scope;
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = EncryptionKey::from_base64(&std::env::var("MAILGATE_ENCRYPTION_KEY")?)?;
//! let store = CredentialStore::new(Database::open("mailgate.db")?);
//!
//! let outcome = store.upsert(
//!     NewAccount {
//!         principal: "user1".to_string(),
//!         external_user_id: "1093".to_string(),
//!         email: "alice@example.com".to_string(),
//!         access_token: "ya29.access".to_string(),
//!         encrypted_refresh_token: encrypt("1//refresh", &key)?,
//!         expiry_date: Utc::now() + Duration::hours(1),
//!         granted_scopes: [Scope::Read].into_iter().collect(),
//!     },
//!     None,
//! )?;
//! assert!(outcome.account.is_default);
//!
//! let default = store.get("user1", None)?;
//! println!("Default account: {}", default.email);
//! # Ok(())
//! # }
//! ```

use crate::oauth::Scope;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

mod encryption;
mod storage;

pub use encryption::{decrypt, encrypt, EncryptionKey};
pub use storage::CredentialStore;

/// One connected third-party account belonging to a principal.
#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    /// Owner of the account
    pub principal: String,

    /// Provider's stable user id (`sub`)
    pub external_user_id: String,

    /// Normalized email address, unique per principal
    pub email: String,

    /// Short-lived provider access token (plaintext)
    pub access_token: String,

    /// Refresh token, encrypted with the master key
    pub encrypted_refresh_token: String,

    /// When the access token expires
    pub expiry_date: DateTime<Utc>,

    /// Scopes granted at connect time, by canonical name
    pub granted_scopes: BTreeSet<Scope>,

    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// True when the access token expires in less than `threshold` from `now`
    /// (or has already expired).
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.expiry_date - now < threshold
    }
}

/// Input for [`CredentialStore::upsert`].
///
/// Carries everything the store replaces on reconnect. The default flag and
/// creation time are owned by the store.
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub principal: String,
    pub external_user_id: String,
    pub email: String,
    pub access_token: String,
    pub encrypted_refresh_token: String,
    pub expiry_date: DateTime<Utc>,
    pub granted_scopes: BTreeSet<Scope>,
}

/// Result of an upsert.
#[derive(Clone, Debug)]
pub struct UpsertOutcome {
    pub account: Account,
    /// True when (principal, email) already existed
    pub reconnected: bool,
    /// Accounts the principal has after the upsert
    pub account_count: usize,
}

/// Normalizes an email address for use as a key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
