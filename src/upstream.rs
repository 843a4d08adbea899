use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};

use crate::auth::{AccessToken, TokenProvider};
use crate::config::{DEFAULT_BASE_URL, DEFAULT_MODEL, RelayConfig};
use crate::types::TransportMode;
use crate::utils::http::{check_status, read_json};
use crate::{RelayError, Result};

/// Raw upstream body chunks, exactly as the network delivered them.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

pub enum UpstreamReply {
    Buffered(String),
    Streaming(ByteStream),
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(text) => f.debug_tuple("Buffered").field(text).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: [CompletionMessageIn<'a>; 1],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct CompletionMessageIn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessageOut>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessageOut {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the upstream `/chat/completions` endpoint.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenProvider>) -> Self {
        Self {
            http,
            tokens,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        http: reqwest::Client,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        Self::new(http, tokens)
            .with_base_url(&config.base_url)
            .with_model(&config.model)
            .with_sampling(config.temperature, config.max_tokens)
            .with_timeout(config.timeout())
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Buffered shortcut for `send(prompt, TransportMode::Buffered)`.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        match self.send(prompt, TransportMode::Buffered).await? {
            UpstreamReply::Buffered(text) => Ok(text),
            UpstreamReply::Streaming(_) => Err(RelayError::InvalidResponse(
                "expected a buffered reply".to_string(),
            )),
        }
    }

    /// Streaming shortcut for `send(prompt, TransportMode::Streaming)`.
    pub async fn open_stream(&self, prompt: &str) -> Result<ByteStream> {
        match self.send(prompt, TransportMode::Streaming).await? {
            UpstreamReply::Streaming(stream) => Ok(stream),
            UpstreamReply::Buffered(_) => Err(RelayError::InvalidResponse(
                "expected a streaming reply".to_string(),
            )),
        }
    }

    pub async fn send(&self, prompt: &str, mode: TransportMode) -> Result<UpstreamReply> {
        let body = CompletionBody {
            model: &self.model,
            messages: [CompletionMessageIn {
                role: "user",
                content: prompt,
            }],
            stream: mode == TransportMode::Streaming,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let response = self.post_with_refresh(&body, mode).await?;

        match mode {
            TransportMode::Buffered => {
                let parsed = read_json::<CompletionResponse>(response)
                    .await
                    .map_err(|err| match err {
                        RelayError::Json(err) => RelayError::InvalidResponse(format!(
                            "malformed completion response: {err}"
                        )),
                        other => other,
                    })?;
                Ok(UpstreamReply::Buffered(first_choice_content(parsed)?))
            }
            TransportMode::Streaming => {
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|err| RelayError::UpstreamUnavailable(err.to_string())))
                    .boxed();
                Ok(UpstreamReply::Streaming(stream))
            }
        }
    }

    /// Sends once; on 401 drops the token, re-exchanges and sends exactly once more.
    async fn post_with_refresh(
        &self,
        body: &CompletionBody<'_>,
        mode: TransportMode,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.ensure_token().await?;
        let response = self.post_once(&token, body, mode).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.checked(response).await;
        }

        tracing::warn!("upstream rejected access token; refreshing once");
        self.tokens.invalidate(&token).await;
        let token = self.tokens.ensure_token().await?;
        let response = self.post_once(&token, body, mode).await?;
        self.checked(response).await
    }

    async fn post_once(
        &self,
        token: &AccessToken,
        body: &CompletionBody<'_>,
        mode: TransportMode,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(self.completions_url())
            .bearer_auth(token.value())
            .json(body);
        request = match mode {
            TransportMode::Buffered => request
                .header(ACCEPT, "application/json")
                .timeout(self.timeout),
            TransportMode::Streaming => request.header(ACCEPT, "text/event-stream"),
        };
        Ok(request.send().await?)
    }

    async fn checked(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        let result = check_status(response).await;
        if result.is_err() {
            tracing::warn!(status = status.as_u16(), "upstream completion request failed");
        } else {
            tracing::debug!(status = status.as_u16(), "upstream completion request accepted");
        }
        result
    }
}

fn first_choice_content(parsed: CompletionResponse) -> Result<String> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::InvalidResponse("completion has no choices".to_string()))?;
    choice
        .message
        .and_then(|message| message.content)
        .ok_or_else(|| RelayError::InvalidResponse("completion choice has no content".to_string()))
}
