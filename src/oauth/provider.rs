//! OAuth provider endpoints: authorization URL, code exchange, refresh and
//! identity lookup.

use super::scope::{Scope, IDENTITY_SCOPES};
use crate::error::{CredentialError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Lifetime assumed when the token endpoint omits `expires_in` or sends a
/// non-positive value.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Upper bound on a provider-reported `expires_in` (one day).
const MAX_EXPIRES_IN_SECS: i64 = 86_400;

/// Provider endpoints and client credentials.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token endpoint URL (exchange and refresh)
    pub token_url: String,

    /// OpenID userinfo endpoint URL
    pub userinfo_url: String,

    /// Client ID (from environment variable)
    pub client_id: String,

    /// Client secret (from environment variable)
    pub client_secret: String,

    /// Callback URL registered with the provider
    pub redirect_uri: String,

    /// Timeout applied to every provider request
    pub request_timeout: std::time::Duration,
}

impl ProviderConfig {
    /// Builds the authorization URL.
    ///
    /// Requests offline access and forces the consent prompt so a refresh
    /// token is issued even when the account was authorized before.
    pub fn build_auth_url(
        &self,
        scopes: &BTreeSet<Scope>,
        state: &str,
        code_challenge: &str,
    ) -> String {
        let scope = scopes
            .iter()
            .map(|s| s.provider_scope())
            .chain(IDENTITY_SCOPES)
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&code_challenge={}&code_challenge_method=S256&access_type=offline&prompt=consent",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scope),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }
}

/// Tokens returned by a successful exchange or refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present on exchange; on refresh only when the provider rotated it
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Identity of the account that completed the consent screen.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub external_user_id: String,
    pub email: String,
}

/// Why a refresh failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// Provider says the grant is permanently invalid (`invalid_grant`).
    Revoked(String),
    /// Network error, timeout, 5xx or any other failure. Retry-eligible.
    Transient(String),
}

/// Network calls made against the OAuth provider.
///
/// The credential core only talks to the provider through this trait, so
/// tests can substitute a local server or a fake.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Exchanges an authorization code and PKCE verifier for tokens.
    async fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<TokenGrant>;

    /// Obtains a new access token with a refresh token.
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError>;

    /// Resolves the identity owning an access token.
    async fn fetch_identity(&self, access_token: &str) -> Result<Identity>;
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth error response body
#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OpenID userinfo response
#[derive(Deserialize, Debug)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> TokenGrant {
        let expires_in = match self.expires_in {
            Some(secs) if secs > 0 => secs.min(MAX_EXPIRES_IN_SECS),
            _ => DEFAULT_EXPIRES_IN_SECS,
        };
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }
}

/// [`OAuthProvider`] over HTTP.
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CredentialError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl OAuthProvider for HttpProvider {
    async fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code_verifier", pkce_verifier),
        ];

        debug!(token_url = %self.config.token_url, "Exchanging authorization code for token");

        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                CredentialError::TokenExchange(format!("Failed to send token exchange request: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(CredentialError::TokenExchange(format!(
                "Token exchange failed with status {}: {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            CredentialError::TokenExchange(format!("Failed to parse token response: {}", e))
        })?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token exchange successful"
        );

        Ok(token_response.into_grant())
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RefreshError::Transient(format!("Token refresh timed out: {}", e))
                } else {
                    RefreshError::Transient(format!("Failed to send token refresh request: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());

            if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
                let detail = match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error.clone(),
                };
                if err.error == "invalid_grant" {
                    return Err(RefreshError::Revoked(detail));
                }
                return Err(RefreshError::Transient(format!(
                    "Token refresh failed with status {}: {}",
                    status, detail
                )));
            }

            return Err(RefreshError::Transient(format!(
                "Token refresh failed with status {}: {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            RefreshError::Transient(format!("Failed to parse token refresh response: {}", e))
        })?;

        Ok(token_response.into_grant())
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| CredentialError::ProfileFetch(format!("Failed to send userinfo request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(CredentialError::ProfileFetch(format!(
                "Userinfo request failed with status {}",
                status
            )));
        }

        let info: UserInfoResponse = response.json().await.map_err(|e| {
            CredentialError::ProfileFetch(format!("Failed to parse userinfo response: {}", e))
        })?;

        let email = info
            .email
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| CredentialError::ProfileFetch("Userinfo response has no email".to_string()))?;

        Ok(Identity {
            external_user_id: info.sub,
            email,
        })
    }
}
