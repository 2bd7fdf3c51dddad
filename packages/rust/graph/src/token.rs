//! Bearer-token cache for the graph API.

use std::time::{Duration, Instant};

use overview_shared::{Credentials, OverviewError, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Obtains a client-credentials token and reuses it until shortly before expiry.
///
/// The lock is held across the exchange, so concurrent callers wait for the
/// single in-flight refresh instead of racing it. Token and expiry are
/// replaced together.
pub struct TokenCache {
    http: Client,
    token_url: String,
    credentials: Credentials,
    refresh_buffer: Duration,
    state: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(
        http: Client,
        token_url: impl Into<String>,
        credentials: Credentials,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            credentials,
            refresh_buffer,
            state: Mutex::new(None),
        }
    }

    /// Return a token valid for at least the refresh buffer.
    pub async fn get(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.as_ref() {
            if cached.expires_at.saturating_duration_since(Instant::now()) > self.refresh_buffer {
                return Ok(cached.value.clone());
            }
            debug!("cached token within refresh buffer, renewing");
        }

        let fresh = self.exchange().await?;
        let value = fresh.value.clone();
        *state = Some(fresh);
        Ok(value)
    }

    async fn exchange(&self) -> Result<CachedToken> {
        let requested_at = Instant::now();

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| OverviewError::Credential(format!("token exchange failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OverviewError::Credential(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            OverviewError::Credential(format!("malformed token response: {e}"))
        })?;

        let value = body
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                OverviewError::Credential("token response did not include an access_token".into())
            })?;
        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        info!(expires_in, "obtained graph API token");

        Ok(CachedToken {
            value,
            expires_at: requested_at + Duration::from_secs(expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
        }
    }

    fn cache(server: &MockServer, buffer_secs: u64) -> TokenCache {
        TokenCache::new(
            Client::new(),
            format!("{}/oidc/token", server.uri()),
            credentials(),
            Duration::from_secs(buffer_secs),
        )
    }

    #[tokio::test]
    async fn token_is_reused_within_lifetime() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .and(basic_auth("client", "secret"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = cache(&server, 60);
        assert_eq!(tokens.get().await.unwrap(), "tok-1");
        assert_eq!(tokens.get().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "shared" }))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tokens = std::sync::Arc::new(cache(&server, 60));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let tokens = tokens.clone();
            handles.push(tokio::spawn(async move { tokens.get().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
    }

    #[tokio::test]
    async fn token_inside_refresh_buffer_is_renewed() {
        let server = MockServer::start().await;

        // Lifetime shorter than the buffer: every call renews.
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short",
                "expires_in": 30
            })))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = cache(&server, 60);
        tokens.get().await.unwrap();
        tokens.get().await.unwrap();
    }

    #[tokio::test]
    async fn missing_access_token_is_credential_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "expires_in": 3600 })),
            )
            .mount(&server)
            .await;

        let err = cache(&server, 60).get().await.unwrap_err();
        assert!(matches!(err, OverviewError::Credential(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = cache(&server, 60).get().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("401"));
    }
}
