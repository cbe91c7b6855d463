//! Error taxonomy for the credential core.
//!
//! Every fallible operation in [`crate::credentials`], [`crate::oauth`] and
//! [`crate::refresher`] returns [`CredentialError`]. Callers decide between
//! "please re-authorize" and "try again shortly" with
//! [`CredentialError::requires_reauthorization`] and
//! [`CredentialError::is_retryable`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// The principal has no connected accounts at all.
    #[error("No accounts connected for this principal")]
    NotConnected,

    /// An explicitly selected account is not connected.
    #[error("Account '{email}' is not connected")]
    AccountNotFound { email: String },

    /// OAuth state missing, expired, or already consumed.
    #[error("Invalid or expired OAuth state")]
    InvalidState,

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Failed to fetch account profile: {0}")]
    ProfileFetch(String),

    /// Provider reported the refresh token as permanently invalid.
    /// The account has been deleted.
    #[error("Access for account '{email}' was revoked")]
    AccountRevoked { email: String },

    /// Transient provider failure (network, timeout, 5xx). Retry-eligible.
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Failed to decrypt stored credentials: {0}")]
    Decryption(String),

    /// Sealing a token failed; nothing was stored.
    #[error("Failed to encrypt credentials: {0}")]
    Encryption(String),

    #[error("Credential invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl CredentialError {
    /// True for failures that may succeed if the caller retries later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Task(_))
    }

    /// True when the only way forward is a fresh authorization flow.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::AccountNotFound { .. }
                | Self::AccountRevoked { .. }
                | Self::Decryption(_)
        )
    }

    /// Message suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected => {
                "No account is connected. Please authorize an account to continue.".to_string()
            }
            Self::AccountNotFound { email } => format!(
                "Account {} is not connected. Please authorize it to continue.",
                email
            ),
            Self::AccountRevoked { email } => format!(
                "Access for {} was revoked or has expired. Please re-authorize the account.",
                email
            ),
            Self::Decryption(_) => {
                "Stored credentials for this account are unreadable. Please re-authorize the account."
                    .to_string()
            }
            Self::InvalidState => {
                "This authorization link has expired or was already used. Please start again."
                    .to_string()
            }
            Self::Provider(_) | Self::Task(_) => {
                "The account provider is temporarily unavailable. Please try again shortly."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = CredentialError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_requires_reauthorization() {
        let err = CredentialError::AccountRevoked {
            email: "a@example.com".to_string(),
        };
        assert!(err.requires_reauthorization());
        assert!(!err.is_retryable());
        assert!(err.user_message().contains("re-authorize"));
    }

    #[test]
    fn test_provider_error_is_retryable() {
        let err = CredentialError::Provider("503 Service Unavailable".to_string());
        assert!(err.is_retryable());
        assert!(!err.requires_reauthorization());
        assert!(err.user_message().contains("try again shortly"));
    }

    #[test]
    fn test_encryption_failure_is_not_a_reauthorization() {
        let err = CredentialError::Encryption("aead::Error".to_string());
        assert!(!err.requires_reauthorization());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_messages_are_distinct() {
        let revoked = CredentialError::AccountRevoked {
            email: "a@example.com".to_string(),
        };
        let transient = CredentialError::Provider("timeout".to_string());
        assert_ne!(revoked.user_message(), transient.user_message());
    }
}
