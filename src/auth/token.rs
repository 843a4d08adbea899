use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::RelayConfig;
use crate::utils::http::{MAX_ERROR_BODY_BYTES, read_json, response_text_truncated};
use crate::{RelayError, Result};

/// Tokens are considered stale this long before the upstream-declared expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AccessToken {
    value: String,
    obtained_at: SystemTime,
    expires_at: Option<SystemTime>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            obtained_at: SystemTime::now(),
            expires_at: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn obtained_at(&self) -> SystemTime {
        self.obtained_at
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Without a declared expiry a token stays usable until upstream answers 401.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => now + EXPIRY_SKEW < expires_at,
            None => true,
        }
    }

    pub fn authorization_header_value(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    /// Milliseconds since the unix epoch.
    #[serde(default)]
    expires_at: Option<u64>,
    /// Seconds from now.
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges the long-lived API key for a bearer token and caches it.
///
/// Readers take the cached token under a shared lock. A refresh runs under a
/// separate single-flight mutex so concurrent first use costs one exchange,
/// and the new token replaces the cache in one write.
pub struct TokenProvider {
    http: reqwest::Client,
    auth_url: String,
    api_key: String,
    scope: String,
    timeout: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh: Mutex<()>,
    exchanges: AtomicU64,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("auth_url", &self.auth_url)
            .field("api_key", &"<redacted>")
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .field("exchanges", &self.exchange_count())
            .finish()
    }
}

impl TokenProvider {
    pub fn new(
        http: reqwest::Client,
        auth_url: impl Into<String>,
        api_key: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self> {
        let auth_url = auth_url.into();
        let api_key = api_key.into();
        if auth_url.trim().is_empty() {
            return Err(RelayError::Config("auth url is required".to_string()));
        }
        if api_key.trim().is_empty() {
            return Err(RelayError::Config("api key is required".to_string()));
        }

        Ok(Self {
            http,
            auth_url,
            api_key,
            scope: scope.into(),
            timeout: Duration::from_secs(30),
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
            exchanges: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &RelayConfig, http: reqwest::Client) -> Result<Self> {
        let api_key = config
            .api_key()
            .ok_or_else(|| RelayError::Config("GIGACHAT_API_KEY is not set".to_string()))?;
        Ok(Self::new(http, &config.auth_url, api_key, &config.scope)?.with_timeout(config.timeout()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the cached token, exchanging the API key first if none is usable.
    pub async fn ensure_token(&self) -> Result<AccessToken> {
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let token = self.exchange().await?;
        self.store(token.clone()).await;
        Ok(token)
    }

    /// Drops `stale` from the cache. A token stored by a concurrent refresh in
    /// the meantime is left alone.
    pub async fn invalidate(&self, stale: &AccessToken) {
        let mut cached = self.cached.write().await;
        if cached
            .as_ref()
            .is_some_and(|current| current.value == stale.value)
        {
            tracing::debug!("dropping stale access token");
            *cached = None;
        }
    }

    pub async fn store(&self, token: AccessToken) {
        *self.cached.write().await = Some(token);
    }

    pub async fn cached_token(&self) -> Option<AccessToken> {
        self.cached.read().await.clone()
    }

    /// Number of credential exchanges attempted so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    async fn fresh_cached(&self) -> Option<AccessToken> {
        let now = SystemTime::now();
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_fresh_at(now))
            .cloned()
    }

    async fn exchange(&self) -> Result<AccessToken> {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        let rq_uid = uuid::Uuid::new_v4().to_string();
        tracing::info!(rq_uid = %rq_uid, auth_url = %self.auth_url, "exchanging api key for access token");

        let response = self
            .http
            .post(self.auth_url.as_str())
            .bearer_auth(&self.api_key)
            .header("RqUID", rq_uid.as_str())
            .header(ACCEPT, "application/json")
            .form(&[("scope", self.scope.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            tracing::warn!(rq_uid = %rq_uid, status = status.as_u16(), "access token exchange rejected");
            return Err(RelayError::UpstreamAuth { status, body });
        }

        let parsed = read_json::<TokenResponse>(response)
            .await
            .map_err(|err| RelayError::UpstreamAuth {
                status,
                body: format!("malformed token response: {err}"),
            })?;
        let value = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| RelayError::UpstreamAuth {
                status,
                body: "token response missing access_token".to_string(),
            })?;

        let token = AccessToken::new(value);
        let expires_at = declared_expiry(token.obtained_at, parsed.expires_at, parsed.expires_in);
        let token = match expires_at {
            Some(expires_at) => token.with_expires_at(expires_at),
            None => token,
        };
        tracing::info!(rq_uid = %rq_uid, "access token obtained");
        Ok(token)
    }
}

/// `expires_at` (ms since epoch) wins over `expires_in` (s). A value that
/// overflows `SystemTime` counts as no declared expiry.
fn declared_expiry(
    obtained_at: SystemTime,
    expires_at_ms: Option<u64>,
    expires_in_secs: Option<u64>,
) -> Option<SystemTime> {
    if let Some(ms) = expires_at_ms {
        return UNIX_EPOCH.checked_add(Duration::from_millis(ms));
    }
    expires_in_secs.and_then(|secs| obtained_at.checked_add(Duration::from_secs(secs)))
}
