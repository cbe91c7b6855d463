//! Account management endpoints.
//!
//! Tokens never leave the process through these endpoints; responses carry
//! account metadata only.

use super::AppError;
use crate::auth::resolve_principal;
use crate::credentials::{Account, CredentialStore};
use crate::error::CredentialError;
use crate::refresher::TokenRefresher;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Shared application state for account API
#[derive(Clone)]
pub struct AccountAppState {
    pub credential_store: Arc<CredentialStore>,
    pub refresher: TokenRefresher,
    pub auth_enabled: bool,
}

/// Account metadata safe to return to clients
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AccountSummary {
    pub email: String,
    pub is_default: bool,
    pub scopes: Vec<String>,
    pub expires_at: String,
    pub connected_at: String,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            is_default: account.is_default,
            scopes: account
                .granted_scopes
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            expires_at: account.expiry_date.to_rfc3339(),
            connected_at: account.created_at.to_rfc3339(),
        }
    }
}

/// List accounts response
#[derive(Serialize)]
pub struct ListAccountsResponse {
    pub accounts: Vec<AccountSummary>,
}

/// Response for DELETE endpoints
#[derive(Serialize)]
pub struct DeleteAccountsResponse {
    pub success: bool,
    pub removed: usize,
}

/// Create account API router
pub fn create_account_router(state: AccountAppState) -> Router {
    Router::new()
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts", delete(delete_all_accounts))
        .route("/api/accounts/:email", delete(delete_account))
        .route("/api/accounts/:email/default", put(set_default_account))
        .route("/api/accounts/:email/refresh", post(refresh_account))
        .with_state(Arc::new(state))
}

/// GET /api/accounts - Default account first, then connection order
async fn list_accounts(
    State(state): State<Arc<AccountAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListAccountsResponse>, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;
    debug!(principal = %principal, "Listing accounts");

    let accounts = state
        .credential_store
        .list(&principal)?
        .iter()
        .map(AccountSummary::from)
        .collect();

    Ok(Json(ListAccountsResponse { accounts }))
}

/// DELETE /api/accounts - Disconnect every account of the principal
async fn delete_all_accounts(
    State(state): State<Arc<AccountAppState>>,
    headers: HeaderMap,
) -> Result<Json<DeleteAccountsResponse>, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;
    let removed = state.credential_store.delete(&principal, None)?;

    Ok(Json(DeleteAccountsResponse {
        success: true,
        removed,
    }))
}

/// DELETE /api/accounts/:email - Disconnect one account
async fn delete_account(
    State(state): State<Arc<AccountAppState>>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Json<DeleteAccountsResponse>, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;
    let removed = state.credential_store.delete(&principal, Some(&email))?;

    if removed == 0 {
        return Err(CredentialError::AccountNotFound { email }.into());
    }

    Ok(Json(DeleteAccountsResponse {
        success: true,
        removed,
    }))
}

/// PUT /api/accounts/:email/default - Make an account the default
async fn set_default_account(
    State(state): State<Arc<AccountAppState>>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Json<AccountSummary>, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;
    let account = state.credential_store.set_default(&principal, &email)?;

    Ok(Json(AccountSummary::from(&account)))
}

/// POST /api/accounts/:email/refresh - Ensure the account holds a usable
/// access token, refreshing it if it is close to expiry
async fn refresh_account(
    State(state): State<Arc<AccountAppState>>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Json<AccountSummary>, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;
    let account = state
        .refresher
        .get_valid_account(&principal, Some(&email))
        .await?;

    Ok(Json(AccountSummary::from(&account)))
}
