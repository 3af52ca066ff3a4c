//! OAuth2 refresh-token exchange and the cached access token.
//!
//! The cache lives behind an async mutex and every refresh happens while the
//! lock is held, so concurrent callers that find the token missing or stale
//! queue behind a single exchange instead of issuing their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use leadbridge_core::config::SalesforceConfig;
use leadbridge_core::{CredentialStore, CrmError, CrmResult};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    issued_at: Instant,
    generation: u64,
}

impl AccessToken {
    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Increases by one on every successful exchange.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Default)]
struct TokenCache {
    current: Option<AccessToken>,
    exchanges: u64,
}

pub struct TokenManager {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    stored_refresh_token: SecretString,
    credentials: Arc<dyn CredentialStore>,
    ttl: Duration,
    cache: Mutex<TokenCache>,
}

impl TokenManager {
    pub fn new(
        http: Client,
        salesforce: &SalesforceConfig,
        credentials: Arc<dyn CredentialStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            token_url: salesforce.token_url.clone(),
            client_id: salesforce.client_id.clone(),
            client_secret: salesforce.client_secret.clone(),
            stored_refresh_token: salesforce.refresh_token.clone(),
            credentials,
            ttl,
            cache: Mutex::new(TokenCache::default()),
        }
    }

    /// Returns the cached token, exchanging the refresh token first when no
    /// token is cached or the cached one has outlived its TTL.
    pub async fn ensure_valid_token(&self) -> CrmResult<AccessToken> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.current.as_ref() {
            if !token.is_stale(self.ttl) {
                return Ok(token.clone());
            }
            debug!(
                event_name = "auth.token.stale",
                generation = token.generation,
                "cached access token exceeded its ttl"
            );
        }
        self.exchange_locked(&mut cache).await
    }

    /// Reactive refresh after the remote rejected `rejected`. When another
    /// caller already replaced that token, the replacement is returned
    /// without a second exchange.
    pub async fn refresh_after_rejection(&self, rejected: &AccessToken) -> CrmResult<AccessToken> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.current.as_ref() {
            if token.generation != rejected.generation && !token.is_stale(self.ttl) {
                debug!(
                    event_name = "auth.token.already_refreshed",
                    generation = token.generation,
                    "rejected token was already replaced"
                );
                return Ok(token.clone());
            }
        }
        warn!(
            event_name = "auth.token.rejected",
            generation = rejected.generation,
            "remote rejected access token; refreshing"
        );
        cache.current = None;
        self.exchange_locked(&mut cache).await
    }

    /// Unconditional exchange, used by operator health checks.
    pub async fn force_refresh(&self) -> CrmResult<AccessToken> {
        let mut cache = self.cache.lock().await;
        self.exchange_locked(&mut cache).await
    }

    /// Number of successful exchanges performed so far.
    pub async fn exchange_count(&self) -> u64 {
        self.cache.lock().await.exchanges
    }

    async fn exchange_locked(&self, cache: &mut TokenCache) -> CrmResult<AccessToken> {
        let refresh_token =
            self.credentials.decrypt_refresh_token(&self.stored_refresh_token)?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|error| CrmError::Transport(format!("token endpoint: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| CrmError::Transport(format!("token endpoint body: {error}")))?;

        if !status.is_success() {
            return Err(CrmError::Auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|error| CrmError::Auth(format!("token response was not JSON: {error}")))?;
        let access_token = payload
            .access_token
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                CrmError::Auth("token response did not include access_token".to_string())
            })?;

        cache.exchanges += 1;
        let token = AccessToken {
            value: SecretString::from(access_token),
            issued_at: Instant::now(),
            generation: cache.exchanges,
        };
        cache.current = Some(token.clone());

        info!(
            event_name = "auth.token.refreshed",
            generation = token.generation,
            "exchanged refresh token for access token"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use leadbridge_core::config::AppConfig;
    use leadbridge_core::{CrmError, PlaintextCredentialStore};
    use secrecy::ExposeSecret;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::TokenManager;

    fn manager(server: &MockServer, ttl: Duration) -> TokenManager {
        let mut config = AppConfig::default();
        config.salesforce.token_url = format!("{}/services/oauth2/token", server.uri());
        config.salesforce.client_id = "client-id".to_string();
        config.salesforce.client_secret = "client-secret".to_string().into();
        config.salesforce.refresh_token = "refresh-token".to_string().into();
        TokenManager::new(
            reqwest::Client::new(),
            &config.salesforce,
            Arc::new(PlaintextCredentialStore),
            ttl,
        )
    }

    #[tokio::test]
    async fn first_call_exchanges_and_later_calls_reuse_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "tok-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::from_secs(3600));
        let first = tokens.ensure_valid_token().await.expect("first token");
        let second = tokens.ensure_valid_token().await.expect("cached token");

        assert_eq!(first.secret().expose_secret(), "tok-1");
        assert_eq!(first.generation(), second.generation());
        assert_eq!(tokens.exchange_count().await, 1);
    }

    #[tokio::test]
    async fn stale_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "tok"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::ZERO);
        let first = tokens.ensure_valid_token().await.expect("first token");
        let second = tokens.ensure_valid_token().await.expect("refreshed token");

        assert_eq!(first.generation() + 1, second.generation());
    }

    #[tokio::test]
    async fn rejected_token_already_replaced_is_not_exchanged_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "tok"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::from_secs(3600));
        let original = tokens.ensure_valid_token().await.expect("token");
        let replacement = tokens.refresh_after_rejection(&original).await.expect("refresh");
        let again = tokens.refresh_after_rejection(&original).await.expect("coalesced");

        assert_eq!(replacement.generation(), 2);
        assert_eq!(again.generation(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok"}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(manager(&server, Duration::from_secs(3600)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tokens = Arc::clone(&tokens);
            handles.push(tokio::spawn(async move { tokens.ensure_valid_token().await }));
        }
        for handle in handles {
            let token = handle.await.expect("join").expect("token");
            assert_eq!(token.generation(), 1);
        }
    }

    #[tokio::test]
    async fn non_success_status_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"expired"}"#),
            )
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::from_secs(3600));
        let error = tokens.ensure_valid_token().await.expect_err("auth failure");

        assert!(matches!(error, CrmError::Auth(ref message) if message.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn missing_access_token_field_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"instance_url": "https://x"})),
            )
            .mount(&server)
            .await;

        let tokens = manager(&server, Duration::from_secs(3600));
        let error = tokens.ensure_valid_token().await.expect_err("missing token");

        assert!(matches!(error, CrmError::Auth(_)));
        assert_eq!(tokens.exchange_count().await, 0);
    }

    #[test]
    fn debug_output_redacts_the_token() {
        let token = super::AccessToken {
            value: "super-secret".to_string().into(),
            issued_at: std::time::Instant::now(),
            generation: 3,
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("generation: 3"));
    }
}
