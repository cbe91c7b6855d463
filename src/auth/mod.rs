//! Principal resolution for the HTTP surface.
//!
//! The upstream authentication layer hands each request an opaque bearer
//! token; that token *is* the principal identifier as far as the credential
//! core is concerned.

use axum::http::HeaderMap;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Principal used for every request when authentication is disabled.
pub const DEFAULT_PRINCIPAL: &str = "default";

/// Resolves the principal for a request.
///
/// With `auth_enabled = false` every request maps to [`DEFAULT_PRINCIPAL`].
pub fn resolve_principal(headers: &HeaderMap, auth_enabled: bool) -> Result<String, TokenError> {
    if !auth_enabled {
        return Ok(DEFAULT_PRINCIPAL.to_string());
    }
    extract_bearer_token(headers)
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone, Error)]
pub enum TokenError {
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}
