use anyhow::{Context, Result};
use mailgate::api::{create_account_router, create_oauth_router, AccountAppState, OAuthAppState};
use mailgate::config::{load_config, MailgateConfig, Secrets};
use mailgate::credentials::CredentialStore;
use mailgate::db::Database;
use mailgate::oauth::{run_state_sweep, AuthorizationFlow, HttpProvider, OAuthStateCache};
use mailgate::refresher::TokenRefresher;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailgate=info,tower_http=info".into()),
        )
        .init();

    info!("mailgate starting...");

    let config = match std::env::var("MAILGATE_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            warn!("MAILGATE_CONFIG not set, using default configuration");
            MailgateConfig::default()
        }
    }
    .apply_env();
    config.validate()?;

    let secrets = Secrets::from_env()?;

    let db = Database::open(&config.storage.path)
        .with_context(|| format!("Failed to open database at {}", config.storage.path))?;
    let credential_store = Arc::new(CredentialStore::new(db.clone()));
    let state_cache = OAuthStateCache::new(db, config.oauth.state_ttl_seconds);

    let provider_config = config.oauth.provider_config(&secrets);
    let provider = Arc::new(HttpProvider::new(provider_config.clone())?);
    let encryption_key = Arc::new(secrets.encryption_key);

    let flow = AuthorizationFlow::new(
        state_cache.clone(),
        Arc::clone(&credential_store),
        provider.clone(),
        provider_config,
        Arc::clone(&encryption_key),
    );

    let refresher = TokenRefresher::new(
        Arc::clone(&credential_store),
        provider,
        encryption_key,
        config.refresh.threshold_seconds,
    );

    tokio::spawn(run_state_sweep(
        state_cache,
        config.oauth.state_sweep_interval_seconds,
    ));

    let app = create_oauth_router(OAuthAppState {
        flow,
        auth_enabled: config.server.auth_enabled,
    })
    .merge(create_account_router(AccountAppState {
        credential_store,
        refresher,
        auth_enabled: config.server.auth_enabled,
    }))
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    info!(
        addr = %config.server.bind_addr,
        auth_enabled = config.server.auth_enabled,
        "HTTP server listening"
    );

    axum::serve(listener, app).await.context("HTTP server error")?;

    Ok(())
}
