// Integration tests for access token refresh

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailgate::credentials::{decrypt, encrypt, CredentialStore, EncryptionKey, NewAccount};
use mailgate::db::Database;
use mailgate::error::{CredentialError, Result};
use mailgate::oauth::{
    HttpProvider, Identity, OAuthProvider, ProviderConfig, RefreshError, Scope, TokenGrant,
};
use mailgate::TokenRefresher;
use mockito::Matcher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const THRESHOLD_SECS: i64 = 300;

#[derive(Clone, Debug)]
enum Behavior {
    Grant { rotate: bool },
    Revoked,
    Transient,
}

struct FakeProvider {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    seen_refresh_tokens: Mutex<Vec<String>>,
    delay: std::time::Duration,
    /// Answer `invalid_grant` for a refresh token that was already used,
    /// like providers that rotate refresh tokens
    reject_reused: bool,
}

impl FakeProvider {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            seen_refresh_tokens: Mutex::new(Vec::new()),
            delay: std::time::Duration::ZERO,
            reject_reused: false,
        }
    }

    fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OAuthProvider for FakeProvider {
    async fn exchange_code(&self, _code: &str, _pkce_verifier: &str) -> Result<TokenGrant> {
        Err(CredentialError::TokenExchange("not used".to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let reused = {
            let mut seen = self.seen_refresh_tokens.lock().unwrap();
            let reused = seen.iter().any(|t| t == refresh_token);
            seen.push(refresh_token.to_string());
            reused
        };
        if self.reject_reused && reused {
            return Err(RefreshError::Revoked("invalid_grant: Token has been revoked.".to_string()));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Grant { rotate } => Ok(TokenGrant {
                access_token: format!("access-refreshed-{}", n),
                refresh_token: rotate.then(|| format!("refresh-rotated-{}", n)),
                expires_at: Utc::now() + Duration::hours(1),
            }),
            Behavior::Revoked => Err(RefreshError::Revoked(
                "invalid_grant: Token has been expired or revoked.".to_string(),
            )),
            Behavior::Transient => Err(RefreshError::Transient(
                "Token refresh failed with status 503".to_string(),
            )),
        }
    }

    async fn fetch_identity(&self, _access_token: &str) -> Result<Identity> {
        Err(CredentialError::ProfileFetch("not used".to_string()))
    }
}

fn test_key() -> Arc<EncryptionKey> {
    Arc::new(EncryptionKey::from_bytes(&[3u8; 32]).unwrap())
}

fn seed(store: &CredentialStore, key: &EncryptionKey, email: &str, expiry: DateTime<Utc>) {
    store
        .upsert(
            NewAccount {
                principal: "u1".to_string(),
                external_user_id: format!("sub-{}", email),
                email: email.to_string(),
                access_token: format!("access-original-{}", email),
                encrypted_refresh_token: encrypt(&format!("refresh-{}", email), key).unwrap(),
                expiry_date: expiry,
                granted_scopes: [Scope::Read].into_iter().collect(),
            },
            None,
        )
        .unwrap();
}

fn setup(provider: Arc<dyn OAuthProvider>) -> (TokenRefresher, Arc<CredentialStore>, Arc<EncryptionKey>) {
    let store = Arc::new(CredentialStore::new(Database::open_in_memory().unwrap()));
    let key = test_key();
    let refresher = TokenRefresher::new(Arc::clone(&store), provider, Arc::clone(&key), THRESHOLD_SECS);
    (refresher, store, key)
}

#[tokio::test]
async fn test_near_expiry_token_is_refreshed() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(4));

    let account = refresher.get_valid_account("u1", None).await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(account.access_token, "access-refreshed-1");
    assert!(account.expiry_date > Utc::now() + Duration::minutes(55));
    assert_eq!(
        provider.seen_refresh_tokens.lock().unwrap().as_slice(),
        ["refresh-alice@example.com".to_string()]
    );

    // Persisted, refresh token unchanged
    let stored = store.get("u1", None).unwrap();
    assert_eq!(stored.access_token, "access-refreshed-1");
    assert_eq!(
        decrypt(&stored.encrypted_refresh_token, &key).unwrap(),
        "refresh-alice@example.com"
    );
}

#[tokio::test]
async fn test_fresh_token_is_returned_without_refresh() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::hours(1));

    let account = refresher.get_valid_account("u1", None).await.unwrap();

    assert_eq!(provider.calls(), 0);
    assert_eq!(account.access_token, "access-original-alice@example.com");
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() - Duration::minutes(10));

    let account = refresher.get_valid_account("u1", None).await.unwrap();
    assert_eq!(provider.calls(), 1);
    assert!(account.expiry_date > Utc::now());
}

#[tokio::test]
async fn test_rotated_refresh_token_is_stored_encrypted() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: true }));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    refresher.get_valid_account("u1", None).await.unwrap();

    let stored = store.get("u1", None).unwrap();
    assert!(!stored.encrypted_refresh_token.contains("refresh-rotated-1"));
    assert_eq!(
        decrypt(&stored.encrypted_refresh_token, &key).unwrap(),
        "refresh-rotated-1"
    );
}

#[tokio::test]
async fn test_revoked_grant_removes_account() {
    let provider = Arc::new(FakeProvider::new(Behavior::Revoked));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));
    seed(&store, &key, "bob@example.com", Utc::now() + Duration::hours(1));

    let result = refresher
        .get_valid_account("u1", Some("alice@example.com"))
        .await;
    assert!(matches!(
        result,
        Err(CredentialError::AccountRevoked { ref email }) if email == "alice@example.com"
    ));

    let remaining: Vec<String> = store.list("u1").unwrap().into_iter().map(|a| a.email).collect();
    assert_eq!(remaining, vec!["bob@example.com".to_string()]);

    // Default moved to the surviving account
    assert!(store.get("u1", None).unwrap().is_default);
    store.check_invariant("u1").unwrap();

    // Later requests keep reporting the revocation without calling the provider
    let again = refresher
        .get_valid_account("u1", Some("alice@example.com"))
        .await;
    assert!(matches!(again, Err(CredentialError::AccountRevoked { .. })));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_revoked_sole_account_leaves_principal_revoked() {
    let provider = Arc::new(FakeProvider::new(Behavior::Revoked));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let first = refresher.get_valid_account("u1", None).await;
    assert!(matches!(first, Err(CredentialError::AccountRevoked { .. })));
    assert!(store.list("u1").unwrap().is_empty());

    let second = refresher.get_valid_account("u1", None).await;
    assert!(matches!(second, Err(CredentialError::AccountRevoked { .. })));
    assert!(second.unwrap_err().requires_reauthorization());
}

#[tokio::test]
async fn test_transient_failure_leaves_account_untouched() {
    let provider = Arc::new(FakeProvider::new(Behavior::Transient));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(2));
    let before = store.get("u1", None).unwrap();

    let result = refresher.get_valid_account("u1", None).await;
    let err = result.unwrap_err();
    assert!(matches!(err, CredentialError::Provider(_)));
    assert!(err.is_retryable());
    assert!(!err.requires_reauthorization());

    let after = store.get("u1", None).unwrap();
    assert_eq!(after, before);

    // Next call retries and succeeds
    provider.set_behavior(Behavior::Grant { rotate: false });
    let account = refresher.get_valid_account("u1", None).await.unwrap();
    assert_eq!(account.access_token, "access-refreshed-2");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_unreadable_refresh_token_is_decryption_error() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, _) = setup(provider.clone());

    let other_key = EncryptionKey::from_bytes(&[9u8; 32]).unwrap();
    seed(&store, &other_key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let result = refresher.get_valid_account("u1", None).await;
    assert!(matches!(result, Err(CredentialError::Decryption(_))));
    assert_eq!(provider.calls(), 0);
    assert_eq!(store.list("u1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_accounts() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, key) = setup(provider.clone());

    let none = refresher.get_valid_account("u1", None).await;
    assert!(matches!(none, Err(CredentialError::NotConnected)));

    seed(&store, &key, "alice@example.com", Utc::now() + Duration::hours(1));
    let missing = refresher
        .get_valid_account("u1", Some("nobody@example.com"))
        .await;
    assert!(matches!(missing, Err(CredentialError::AccountNotFound { .. })));
}

#[tokio::test]
async fn test_selector_refreshes_only_selected_account() {
    let provider = Arc::new(FakeProvider::new(Behavior::Grant { rotate: false }));
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));
    seed(&store, &key, "bob@example.com", Utc::now() + Duration::minutes(1));

    let bob = refresher
        .get_valid_account("u1", Some("Bob@Example.com"))
        .await
        .unwrap();
    assert_eq!(bob.email, "bob@example.com");
    assert_eq!(provider.calls(), 1);

    let alice = store.get("u1", Some("alice@example.com")).unwrap();
    assert_eq!(alice.access_token, "access-original-alice@example.com");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_refresh() {
    let provider = Arc::new(FakeProvider {
        delay: std::time::Duration::from_millis(100),
        ..FakeProvider::new(Behavior::Grant { rotate: true })
    });
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.get_valid_account("u1", None).await })
        })
        .collect();

    for handle in handles {
        let account = handle.await.unwrap().unwrap();
        assert_eq!(account.access_token, "access-refreshed-1");
    }

    assert_eq!(provider.calls(), 1);
    assert_eq!(
        decrypt(&store.get("u1", None).unwrap().encrypted_refresh_token, &key).unwrap(),
        "refresh-rotated-1"
    );
}

#[tokio::test]
async fn test_dropped_caller_still_persists_refresh() {
    let provider = Arc::new(FakeProvider {
        delay: std::time::Duration::from_millis(100),
        ..FakeProvider::new(Behavior::Grant { rotate: true })
    });
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let timed_out = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        refresher.get_valid_account("u1", None),
    )
    .await;
    assert!(timed_out.is_err());

    // Let the detached refresh finish
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let stored = store.get("u1", None).unwrap();
    assert_eq!(stored.access_token, "access-refreshed-1");
    assert_eq!(
        decrypt(&stored.encrypted_refresh_token, &key).unwrap(),
        "refresh-rotated-1"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_caller_keeps_refresh_exclusive() {
    let provider = Arc::new(FakeProvider {
        delay: std::time::Duration::from_millis(100),
        reject_reused: true,
        ..FakeProvider::new(Behavior::Grant { rotate: true })
    });
    let (refresher, store, key) = setup(provider.clone());
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let timed_out = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        refresher.get_valid_account("u1", None),
    )
    .await;
    assert!(timed_out.is_err());

    // Waits for the in-flight refresh instead of replaying the old token
    let account = refresher.get_valid_account("u1", None).await.unwrap();

    assert_eq!(account.access_token, "access-refreshed-1");
    assert_eq!(provider.calls(), 1);
    assert_eq!(store.list("u1").unwrap().len(), 1);
    assert_eq!(
        decrypt(&account.encrypted_refresh_token, &key).unwrap(),
        "refresh-rotated-1"
    );
}

/// Reconnects the account (new refresh token) while a refresh is in
/// flight, then answers with `outcome`.
struct ReconnectingProvider {
    store: Arc<CredentialStore>,
    key: Arc<EncryptionKey>,
    outcome: Behavior,
}

#[async_trait]
impl OAuthProvider for ReconnectingProvider {
    async fn exchange_code(&self, _code: &str, _pkce_verifier: &str) -> Result<TokenGrant> {
        Err(CredentialError::TokenExchange("not used".to_string()))
    }

    async fn refresh(&self, _refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError> {
        self.store
            .upsert(
                NewAccount {
                    principal: "u1".to_string(),
                    external_user_id: "sub-alice".to_string(),
                    email: "alice@example.com".to_string(),
                    access_token: "access-reconnected".to_string(),
                    encrypted_refresh_token: encrypt("refresh-NEW", &self.key).unwrap(),
                    expiry_date: Utc::now() + Duration::hours(1),
                    granted_scopes: [Scope::Read].into_iter().collect(),
                },
                None,
            )
            .unwrap();

        match self.outcome {
            Behavior::Grant { rotate } => Ok(TokenGrant {
                access_token: "access-stale".to_string(),
                refresh_token: rotate.then(|| "refresh-stale-rotation".to_string()),
                expires_at: Utc::now() + Duration::hours(1),
            }),
            Behavior::Revoked => Err(RefreshError::Revoked("invalid_grant".to_string())),
            Behavior::Transient => Err(RefreshError::Transient("status 503".to_string())),
        }
    }

    async fn fetch_identity(&self, _access_token: &str) -> Result<Identity> {
        Err(CredentialError::ProfileFetch("not used".to_string()))
    }
}

fn reconnecting_setup(outcome: Behavior) -> (TokenRefresher, Arc<CredentialStore>, Arc<EncryptionKey>) {
    let store = Arc::new(CredentialStore::new(Database::open_in_memory().unwrap()));
    let key = test_key();
    let provider = Arc::new(ReconnectingProvider {
        store: Arc::clone(&store),
        key: Arc::clone(&key),
        outcome,
    });
    let refresher = TokenRefresher::new(Arc::clone(&store), provider, Arc::clone(&key), THRESHOLD_SECS);
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));
    (refresher, store, key)
}

#[tokio::test]
async fn test_stale_revocation_keeps_reconnected_account() {
    let (refresher, store, key) = reconnecting_setup(Behavior::Revoked);

    let account = refresher.get_valid_account("u1", None).await.unwrap();

    assert_eq!(account.access_token, "access-reconnected");
    assert_eq!(decrypt(&account.encrypted_refresh_token, &key).unwrap(), "refresh-NEW");
    assert_eq!(store.list("u1").unwrap().len(), 1);
    assert!(store.get("u1", Some("alice@example.com")).is_ok());
}

#[tokio::test]
async fn test_stale_refresh_does_not_overwrite_reconnect() {
    let (refresher, store, key) = reconnecting_setup(Behavior::Grant { rotate: true });

    let account = refresher.get_valid_account("u1", None).await.unwrap();

    assert_eq!(account.access_token, "access-reconnected");
    let stored = store.get("u1", None).unwrap();
    assert_eq!(stored.access_token, "access-reconnected");
    assert_eq!(decrypt(&stored.encrypted_refresh_token, &key).unwrap(), "refresh-NEW");
}

fn http_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        auth_url: format!("{}/auth", base_url),
        token_url: format!("{}/token", base_url),
        userinfo_url: format!("{}/userinfo", base_url),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "http://localhost:3000/oauth/callback".to_string(),
        request_timeout: std::time::Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_http_refresh_near_expiry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-alice@example.com".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.new","expires_in":3599,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;

    let provider = Arc::new(HttpProvider::new(http_config(&server.url())).unwrap());
    let (refresher, store, key) = setup(provider);
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(4));

    let account = refresher.get_valid_account("u1", None).await.unwrap();
    assert_eq!(account.access_token, "ya29.new");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_fresh_token_makes_no_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let provider = Arc::new(HttpProvider::new(http_config(&server.url())).unwrap());
    let (refresher, store, key) = setup(provider);
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::hours(1));

    refresher.get_valid_account("u1", None).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_invalid_grant_revokes() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
        .create_async()
        .await;

    let provider = Arc::new(HttpProvider::new(http_config(&server.url())).unwrap());
    let (refresher, store, key) = setup(provider);
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let result = refresher.get_valid_account("u1", None).await;
    assert!(matches!(result, Err(CredentialError::AccountRevoked { .. })));
    assert!(store.list("u1").unwrap().is_empty());
}

#[tokio::test]
async fn test_http_server_error_is_transient() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let provider = Arc::new(HttpProvider::new(http_config(&server.url())).unwrap());
    let (refresher, store, key) = setup(provider);
    seed(&store, &key, "alice@example.com", Utc::now() + Duration::minutes(1));

    let result = refresher.get_valid_account("u1", None).await;
    assert!(matches!(result, Err(CredentialError::Provider(_))));
    assert_eq!(
        store.get("u1", None).unwrap().access_token,
        "access-original-alice@example.com"
    );
}
