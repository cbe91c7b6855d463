//! OAuth 2.0 endpoints for connecting accounts.
//!
//! 1. Client opens GET /oauth/start?scopes=read,modify → redirect to provider
//! 2. User consents on the provider's site
//! 3. Provider redirects to GET /oauth/callback?code=...&state=...
//! 4. Code is exchanged and encrypted credentials are stored

use super::AppError;
use crate::auth::resolve_principal;
use crate::oauth::AuthorizationFlow;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};


/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub flow: AuthorizationFlow,
    pub auth_enabled: bool,
}

/// Query parameters for the start endpoint
#[derive(Deserialize)]
pub struct OAuthStart {
    /// Comma-separated scope names
    #[serde(default)]
    scopes: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth success response
#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    success: bool,
    message: String,
    email: String,
    reconnected: bool,
    is_default: bool,
    account_count: usize,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

/// GET /oauth/start
///
/// Redirects the user to the provider's consent page.
async fn oauth_start(
    State(state): State<Arc<OAuthAppState>>,
    Query(params): Query<OAuthStart>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let principal = resolve_principal(&headers, state.auth_enabled)?;

    let scope_names: Vec<&str> = params
        .scopes
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    debug!(principal = %principal, scopes = ?scope_names, "OAuth start requested");

    let auth_url = state.flow.start_authorization(&principal, &scope_names)?;

    info!(principal = %principal, "Redirecting to OAuth provider");
    Ok(Redirect::temporary(&auth_url))
}

/// GET /oauth/callback
///
/// Provider redirect target. The principal comes from the stored state, not
/// from the request.
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");

        if let Some(csrf_state) = callback.state.as_deref() {
            state.flow.abandon(csrf_state);
        }
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let outcome = state.flow.complete_authorization(&code, &csrf_state).await?;

    Ok(Json(OAuthSuccessResponse {
        success: true,
        message: outcome.summary(),
        email: outcome.account.email,
        reconnected: outcome.reconnected,
        is_default: outcome.account.is_default,
        account_count: outcome.account_count,
    }))
}
