// Error taxonomy
pub mod error;

// SQLite connection and schema
pub mod db;

// Encrypted account storage
pub mod credentials;

// OAuth authorization flow, state cache and provider calls
pub mod oauth;

// Valid-token access for downstream API clients
pub mod refresher;

// Principal resolution for HTTP requests
pub mod auth;

// HTTP endpoints
pub mod api;

// Configuration loading
pub mod config;

pub use credentials::{Account, CredentialStore, EncryptionKey};
pub use error::CredentialError;
pub use oauth::{AuthorizationFlow, OAuthStateCache, Scope};
pub use refresher::TokenRefresher;
