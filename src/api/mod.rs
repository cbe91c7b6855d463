//! HTTP surface: the two OAuth endpoints and account management.

pub mod accounts;
pub mod oauth;

pub use accounts::{create_account_router, AccountAppState};
pub use oauth::{create_oauth_router, OAuthAppState};

use crate::auth::TokenError;
use crate::error::CredentialError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    /// What the client should do next: "reauthorize" or "retry"
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
}

/// Application error types for the HTTP API
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Credential(CredentialError),
}

impl From<CredentialError> for AppError {
    fn from(e: CredentialError) -> Self {
        AppError::Credential(e)
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Unauthorized(format!("Invalid token: {}", e))
    }
}

fn credential_status(e: &CredentialError) -> StatusCode {
    match e {
        CredentialError::InvalidScope(_) => StatusCode::BAD_REQUEST,
        CredentialError::InvalidState => StatusCode::BAD_REQUEST,
        CredentialError::NotConnected | CredentialError::AccountNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        CredentialError::AccountRevoked { .. } => StatusCode::UNAUTHORIZED,
        CredentialError::TokenExchange(_) | CredentialError::ProfileFetch(_) => {
            StatusCode::BAD_GATEWAY
        }
        CredentialError::Provider(_) | CredentialError::Task(_) => StatusCode::SERVICE_UNAVAILABLE,
        CredentialError::Decryption(_)
        | CredentialError::Encryption(_)
        | CredentialError::InvariantViolation(_)
        | CredentialError::InvalidKey(_)
        | CredentialError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: msg,
                    action: None,
                },
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: msg,
                    action: None,
                },
            ),
            AppError::Credential(e) => {
                let status = credential_status(&e);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }

                let action = if e.requires_reauthorization() {
                    Some("reauthorize")
                } else if e.is_retryable() {
                    Some("retry")
                } else {
                    None
                };

                (
                    status,
                    ErrorResponse {
                        error: e.user_message(),
                        action,
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
