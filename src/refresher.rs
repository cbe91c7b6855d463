//! Hands out accounts whose access token is valid for at least the refresh
//! threshold, refreshing through the provider when needed.
//!
//! Per-account lifecycle:
//!
//! ```text
//! Fresh ──▶ NearExpiry ──▶ Refreshing ──▶ Fresh
//!                ▲              │
//!                │              ├──▶ Revoked (row deleted, terminal)
//!                │              ▼
//!                └────── TransientFailure
//! ```

use crate::credentials::{decrypt, encrypt, Account, CredentialStore, EncryptionKey};
use crate::error::{CredentialError, Result};
use crate::oauth::{OAuthProvider, RefreshError};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type AccountKey = (String, String);

/// Guarantees callers a non-expired access token.
#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    provider: Arc<dyn OAuthProvider>,
    encryption_key: Arc<EncryptionKey>,
    threshold: Duration,
    /// Per-(principal, email) guards so one account is refreshed at a time.
    /// Holds no credential data.
    in_flight: Arc<DashMap<AccountKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    /// # Arguments
    /// * `threshold_seconds` - Refresh when the token expires sooner than this (default: 300)
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn OAuthProvider>,
        encryption_key: Arc<EncryptionKey>,
        threshold_seconds: i64,
    ) -> Self {
        Self {
            store,
            provider,
            encryption_key,
            threshold: Duration::seconds(threshold_seconds),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Returns the selected account (default when `email` is `None`) with an
    /// access token that stays valid for at least the threshold.
    ///
    /// # Errors
    /// * `NotConnected` / `AccountNotFound` - nothing to return
    /// * `AccountRevoked` - provider revoked the grant; the account is gone
    ///   (unless it was reconnected meanwhile, in which case the reconnected
    ///   account is returned)
    /// * `Provider` - transient failure, account left untouched
    /// * `Decryption` - stored refresh token unreadable
    pub async fn get_valid_account(&self, principal: &str, email: Option<&str>) -> Result<Account> {
        let account = self.store.get(principal, email)?;
        if !self.needs_refresh(&account) {
            return Ok(account);
        }

        let key = (principal.to_string(), account.email.clone());
        let guard = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = self
            .refresh_exclusive(Arc::clone(&guard), principal, &account.email)
            .await;

        drop(guard);
        self.in_flight
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn refresh_exclusive(
        &self,
        guard: Arc<tokio::sync::Mutex<()>>,
        principal: &str,
        email: &str,
    ) -> Result<Account> {
        let held = guard.lock_owned().await;

        // Another caller may have refreshed (or revoked) while we waited
        let current = self.store.get(principal, Some(email))?;
        if !self.needs_refresh(&current) {
            debug!(principal = %principal, email = %email, "Token already refreshed by another caller");
            return Ok(current);
        }

        // Held until the outcome is persisted, even if this caller is dropped
        let refresher = self.clone();
        tokio::spawn(async move {
            let result = refresher.refresh(current).await;
            drop(held);
            result
        })
        .await
        .map_err(|e| CredentialError::Task(e.to_string()))?
    }

    fn needs_refresh(&self, account: &Account) -> bool {
        account.expires_within(self.threshold, Utc::now())
    }

    /// Refreshes one account and persists the outcome. Runs detached from the
    /// caller.
    async fn refresh(&self, account: Account) -> Result<Account> {
        let principal = account.principal.as_str();
        let email = account.email.as_str();

        let refresh_token = decrypt(&account.encrypted_refresh_token, &self.encryption_key)
            .map_err(|e| {
                error!(principal = %principal, email = %email, error = %e, "Stored refresh token is unreadable");
                e
            })?;

        info!(principal = %principal, email = %email, "Refreshing OAuth token");

        match self.provider.refresh(&refresh_token).await {
            Ok(grant) => {
                let rotated = grant
                    .refresh_token
                    .as_deref()
                    .map(|token| encrypt(token, &self.encryption_key))
                    .transpose()?;

                let updated = self.store.update_tokens(
                    principal,
                    email,
                    &account.encrypted_refresh_token,
                    &grant.access_token,
                    grant.expires_at,
                    rotated.as_deref(),
                )?;

                match updated {
                    Some(updated) => {
                        info!(
                            principal = %principal,
                            email = %email,
                            rotated = rotated.is_some(),
                            "OAuth token refreshed successfully"
                        );
                        Ok(updated)
                    }
                    None => {
                        info!(principal = %principal, email = %email, "Account reconnected during refresh, using new credentials");
                        self.store.get(principal, Some(email))
                    }
                }
            }
            Err(RefreshError::Revoked(reason)) => {
                if !self
                    .store
                    .revoke(principal, email, &account.encrypted_refresh_token)?
                {
                    info!(principal = %principal, email = %email, "Revoked refresh token was already replaced, using new credentials");
                    return self.store.get(principal, Some(email));
                }

                warn!(principal = %principal, email = %email, reason = %reason, "Refresh token revoked");
                Err(CredentialError::AccountRevoked {
                    email: email.to_string(),
                })
            }
            Err(RefreshError::Transient(reason)) => {
                warn!(principal = %principal, email = %email, reason = %reason, "Token refresh failed, will retry on next request");
                Err(CredentialError::Provider(reason))
            }
        }
    }
}
