//! OAuth 2.0 authorization code flow with PKCE.
//!
//! - [`scope`]: closed set of scope names and their provider identifiers
//! - [`pkce`]: verifier, challenge and state token generation
//! - [`state`]: one-time, expiring state records
//! - [`provider`]: token endpoint, refresh and identity calls
//! - [`flow`]: start/complete orchestration

pub mod flow;
pub mod pkce;
pub mod provider;
pub mod scope;
pub mod state;

pub use flow::{AuthorizationFlow, ConnectOutcome};
pub use provider::{HttpProvider, Identity, OAuthProvider, ProviderConfig, RefreshError, TokenGrant};
pub use scope::Scope;
pub use state::{run_state_sweep, OAuthState, OAuthStateCache};
