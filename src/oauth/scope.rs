//! Canonical scope names and their provider scope identifiers.

use crate::error::CredentialError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identity scopes always requested alongside the mapped ones so the
/// connecting account's address can be resolved after the exchange.
pub const IDENTITY_SCOPES: [&str; 2] = ["openid", "email"];

/// Permission a principal can grant for a connected account.
///
/// The set is closed: anything not listed here never reaches the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Modify,
    Compose,
    Send,
    Labels,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Read,
        Scope::Modify,
        Scope::Compose,
        Scope::Send,
        Scope::Labels,
    ];

    /// Short name exposed to the rest of the system.
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Read => "read",
            Scope::Modify => "modify",
            Scope::Compose => "compose",
            Scope::Send => "send",
            Scope::Labels => "labels",
        }
    }

    /// Full provider scope identifier.
    pub fn provider_scope(self) -> &'static str {
        match self {
            Scope::Read => "https://www.googleapis.com/auth/gmail.readonly",
            Scope::Modify => "https://www.googleapis.com/auth/gmail.modify",
            Scope::Compose => "https://www.googleapis.com/auth/gmail.compose",
            Scope::Send => "https://www.googleapis.com/auth/gmail.send",
            Scope::Labels => "https://www.googleapis.com/auth/gmail.labels",
        }
    }

    /// Validates a list of scope names. Duplicates collapse; an empty list
    /// is rejected.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<BTreeSet<Scope>, CredentialError> {
        if names.is_empty() {
            return Err(CredentialError::InvalidScope(
                "at least one scope must be requested".to_string(),
            ));
        }

        names.iter().map(|name| name.as_ref().parse()).collect()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s.trim())
            .ok_or_else(|| CredentialError::InvalidScope(s.to_string()))
    }
}

/// Joins scopes into the space-separated form used for storage.
pub fn join_scopes(scopes: &BTreeSet<Scope>) -> String {
    scopes
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`join_scopes`].
pub fn split_scopes(joined: &str) -> Result<BTreeSet<Scope>, CredentialError> {
    joined.split_whitespace().map(str::parse).collect()
}
