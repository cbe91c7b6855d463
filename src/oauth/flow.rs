//! Authorization code flow with PKCE for connecting accounts.
//!
//! 1. Caller asks to connect an account with a set of scope names
//! 2. [`AuthorizationFlow::start_authorization`] stores a one-time state and
//!    returns the provider URL
//! 3. User consents on the provider's site
//! 4. Provider redirects back with `code` and `state`
//! 5. [`AuthorizationFlow::complete_authorization`] exchanges the code,
//!    resolves the account's address and stores encrypted credentials

use super::pkce::{code_challenge, generate_code_verifier};
use super::provider::{OAuthProvider, ProviderConfig};
use super::scope::Scope;
use super::state::{OAuthState, OAuthStateCache};
use crate::credentials::{encrypt, Account, CredentialStore, EncryptionKey, NewAccount};
use crate::error::{CredentialError, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a completed authorization.
#[derive(Clone, Debug)]
pub struct ConnectOutcome {
    pub account: Account,
    /// True when the account was already connected
    pub reconnected: bool,
    /// Accounts the principal has after this connect
    pub account_count: usize,
}

impl ConnectOutcome {
    /// One-line confirmation for the end user.
    pub fn summary(&self) -> String {
        let verb = if self.reconnected {
            "Reconnected"
        } else {
            "Connected"
        };
        let default_note = if self.account.is_default {
            " (default account)"
        } else {
            ""
        };
        let plural = if self.account_count == 1 { "" } else { "s" };

        format!(
            "{} {}{}. You now have {} connected account{}.",
            verb, self.account.email, default_note, self.account_count, plural
        )
    }
}

/// Connects third-party accounts to principals.
#[derive(Clone)]
pub struct AuthorizationFlow {
    states: OAuthStateCache,
    store: Arc<CredentialStore>,
    provider: Arc<dyn OAuthProvider>,
    provider_config: Arc<ProviderConfig>,
    encryption_key: Arc<EncryptionKey>,
}

impl AuthorizationFlow {
    pub fn new(
        states: OAuthStateCache,
        store: Arc<CredentialStore>,
        provider: Arc<dyn OAuthProvider>,
        provider_config: ProviderConfig,
        encryption_key: Arc<EncryptionKey>,
    ) -> Self {
        Self {
            states,
            store,
            provider,
            provider_config: Arc::new(provider_config),
            encryption_key,
        }
    }

    /// Returns the provider authorization URL for `principal`.
    ///
    /// Fails with `InvalidScope` if any name is not a known scope.
    pub fn start_authorization<S: AsRef<str>>(
        &self,
        principal: &str,
        scope_names: &[S],
    ) -> Result<String> {
        let scopes = Scope::parse_list(scope_names).map_err(|e| {
            warn!(principal = %principal, error = %e, "Rejected authorization request");
            e
        })?;

        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);
        let state = self.states.issue(principal, scopes, verifier)?;

        debug!(
            principal = %principal,
            scopes = ?state.requested_scopes,
            expires_at = %state.expires_at,
            "Authorization started"
        );

        Ok(self
            .provider_config
            .build_auth_url(&state.requested_scopes, &state.state_token, &challenge))
    }

    /// Completes an authorization started by [`start_authorization`](Self::start_authorization).
    ///
    /// The state is consumed first; nothing else happens if it is unknown,
    /// expired or already used. The exchange and the write run on a detached
    /// task so a caller that goes away does not abort a half-finished connect.
    pub async fn complete_authorization(&self, code: &str, state_token: &str) -> Result<ConnectOutcome> {
        let state = self.states.consume(state_token).map_err(|e| {
            warn!("Invalid or expired OAuth state (possible CSRF or replay)");
            e
        })?;

        debug!(principal = %state.principal, "OAuth state validated");

        let flow = self.clone();
        let code = code.to_string();
        tokio::spawn(async move { flow.finish(&code, state).await })
            .await
            .map_err(|e| CredentialError::Task(e.to_string()))?
    }

    async fn finish(&self, code: &str, state: OAuthState) -> Result<ConnectOutcome> {
        let principal = state.principal.as_str();

        let grant = self
            .provider
            .exchange_code(code, &state.pkce_verifier)
            .await
            .map_err(|e| {
                error!(principal = %principal, error = %e, "Token exchange failed");
                e
            })?;

        let refresh_token = grant.refresh_token.ok_or_else(|| {
            error!(principal = %principal, "Token response did not include a refresh token");
            CredentialError::TokenExchange("provider did not return a refresh token".to_string())
        })?;

        let identity = self
            .provider
            .fetch_identity(&grant.access_token)
            .await
            .map_err(|e| {
                error!(principal = %principal, error = %e, "Failed to resolve account identity");
                e
            })?;

        let encrypted_refresh_token = encrypt(&refresh_token, &self.encryption_key)?;

        let outcome = self.store.upsert(
            NewAccount {
                principal: principal.to_string(),
                external_user_id: identity.external_user_id,
                email: identity.email,
                access_token: grant.access_token,
                encrypted_refresh_token,
                expiry_date: grant.expires_at,
                granted_scopes: state.requested_scopes,
            },
            None,
        )?;

        info!(
            principal = %principal,
            email = %outcome.account.email,
            reconnected = outcome.reconnected,
            account_count = outcome.account_count,
            "OAuth flow completed successfully"
        );

        Ok(ConnectOutcome {
            account: outcome.account,
            reconnected: outcome.reconnected,
            account_count: outcome.account_count,
        })
    }

    /// Drops a pending state without completing it (e.g. the user denied
    /// consent). Unknown tokens are ignored.
    pub fn abandon(&self, state_token: &str) {
        if self.states.consume(state_token).is_ok() {
            debug!("Pending OAuth state discarded");
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }
}
