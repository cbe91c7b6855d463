use crate::credentials::EncryptionKey;
use crate::oauth::ProviderConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Complete mailgate configuration
///
/// Secrets never come from the file; see [`Secrets::from_env`].
#[derive(Debug, Clone, Deserialize)]
pub struct MailgateConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Durable storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "mailgate.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// OAuth provider and state configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long a started authorization stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// How often expired states are swept (seconds)
    #[serde(default = "default_state_sweep_interval")]
    pub state_sweep_interval_seconds: u64,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    /// Timeout for every provider request (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_sweep_interval() -> u64 {
    60
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/oauth/callback".to_string()
}

fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_userinfo_url() -> String {
    "https://openidconnect.googleapis.com/v1/userinfo".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_sweep_interval_seconds: default_state_sweep_interval(),
            redirect_uri: default_redirect_uri(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            userinfo_url: default_userinfo_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl OAuthConfig {
    /// Combines endpoint settings with client credentials.
    pub fn provider_config(&self, secrets: &Secrets) -> ProviderConfig {
        ProviderConfig {
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            userinfo_url: self.userinfo_url.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            request_timeout: std::time::Duration::from_secs(self.request_timeout_seconds),
        }
    }
}

/// Token refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh when the access token expires sooner than this (seconds)
    #[serde(default = "default_refresh_threshold")]
    pub threshold_seconds: i64,
}

fn default_refresh_threshold() -> i64 {
    300
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_refresh_threshold(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// When false every request acts as the `default` principal
    #[serde(default = "default_auth_enabled")]
    pub auth_enabled: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_auth_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            auth_enabled: default_auth_enabled(),
        }
    }
}

impl Default for MailgateConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            oauth: OAuthConfig::default(),
            refresh: RefreshConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl MailgateConfig {
    /// Applies `MAILGATE_*` environment overrides for non-secret settings.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("MAILGATE_DB_PATH") {
            self.storage.path = v;
        }
        if let Ok(v) = std::env::var("MAILGATE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MAILGATE_REDIRECT_URI") {
            self.oauth.redirect_uri = v;
        }
        if let Ok(v) = std::env::var("MAILGATE_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.server.auth_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("MAILGATE_REFRESH_THRESHOLD_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.refresh.threshold_seconds = n;
            }
        }
        self
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.state_sweep_interval_seconds == 0 {
            bail!("oauth.state_sweep_interval_seconds must be greater than 0");
        }
        if self.oauth.state_ttl_seconds <= 0 {
            bail!("oauth.state_ttl_seconds must be greater than 0");
        }
        if self.oauth.request_timeout_seconds == 0 {
            bail!("oauth.request_timeout_seconds must be greater than 0");
        }
        if self.refresh.threshold_seconds < 0 {
            bail!("refresh.threshold_seconds must not be negative");
        }
        Ok(())
    }
}

/// Secrets loaded from the environment only.
pub struct Secrets {
    pub encryption_key: EncryptionKey,
    pub client_id: String,
    pub client_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("MAILGATE_ENCRYPTION_KEY")
            .context("MAILGATE_ENCRYPTION_KEY is not set (base64-encoded 32-byte key)")?;
        let encryption_key =
            EncryptionKey::from_base64(&encryption_key).context("Invalid MAILGATE_ENCRYPTION_KEY")?;

        let client_id = std::env::var("MAILGATE_OAUTH_CLIENT_ID")
            .context("MAILGATE_OAUTH_CLIENT_ID is not set")?;
        let client_secret = std::env::var("MAILGATE_OAUTH_CLIENT_SECRET")
            .context("MAILGATE_OAUTH_CLIENT_SECRET is not set")?;

        Ok(Self {
            encryption_key,
            client_id,
            client_secret,
        })
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<MailgateConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: MailgateConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path))?;
    Ok(config)
}
