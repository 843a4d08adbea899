use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use crate::fallback::FallbackResponder;
use crate::sse::{SseFrameParser, SseLimits};
use crate::types::{ChatReply, ChatTurnRequest, DownstreamEvent, UpstreamEvent};
use crate::upstream::{ByteStream, UpstreamClient};
use crate::{RelayError, Result};

/// Downstream events of one streaming turn. Failures arrive as an `error`
/// event, so items are never `Err`.
pub type EventStream = BoxStream<'static, DownstreamEvent>;

/// Anything that can answer a chat turn: the upstream relay or a stand-in.
#[async_trait]
pub trait ChatRelay: Send + Sync {
    async fn complete(&self, request: &ChatTurnRequest) -> Result<ChatReply>;

    /// Ends with exactly one terminal event (`done: true` or `error`).
    fn stream(&self, request: ChatTurnRequest) -> EventStream;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    TokenReady,
    Streaming,
    Buffered,
    Delegated,
    Completed,
    Failed,
}

impl TurnState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Relays chat turns to the upstream completion API.
#[derive(Clone, Debug)]
pub struct RelayEngine {
    upstream: UpstreamClient,
    fallback: Option<Arc<FallbackResponder>>,
    limits: SseLimits,
}

impl RelayEngine {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self {
            upstream,
            fallback: None,
            limits: SseLimits::default(),
        }
    }

    /// Turns that fail with `UpstreamUnavailable` before anything was sent
    /// downstream are answered by `fallback` instead.
    pub fn with_fallback(mut self, fallback: FallbackResponder) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn with_sse_limits(mut self, limits: SseLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Re-frames an already opened upstream SSE body as downstream events.
    /// The body is read only as fast as the returned stream is polled.
    pub fn relay_upstream(&self, request: ChatTurnRequest, upstream: ByteStream) -> EventStream {
        let mut turn = StreamTurn::new(self.clone(), request);
        turn.upstream = Some(upstream);
        turn.state = TurnState::Streaming;
        turn.into_events()
    }

    fn fallback_for(&self, err: &RelayError) -> Option<Arc<FallbackResponder>> {
        if err.is_unavailable() {
            self.fallback.clone()
        } else {
            None
        }
    }

    async fn run_buffered(&self, request: &ChatTurnRequest, state: &mut TurnState) -> Result<String> {
        self.upstream.tokens().ensure_token().await?;
        *state = TurnState::Buffered;
        let response = self.upstream.complete(&request.message).await?;
        *state = TurnState::Completed;
        Ok(response)
    }
}

#[async_trait]
impl ChatRelay for RelayEngine {
    #[tracing::instrument(name = "turn", skip_all, fields(dialog_id = %request.dialog_id, stream = false))]
    async fn complete(&self, request: &ChatTurnRequest) -> Result<ChatReply> {
        request.validate()?;
        let started = Instant::now();
        let mut state = TurnState::Idle;

        match self.run_buffered(request, &mut state).await {
            Ok(response) => {
                tracing::info!(
                    chars = response.chars().count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn completed"
                );
                Ok(ChatReply { response })
            }
            Err(err) => {
                if let Some(fallback) = self.fallback_for(&err) {
                    tracing::warn!(error = %err, ?state, "upstream unavailable; answering from fallback");
                    return fallback.complete(request).await;
                }
                tracing::warn!(error = %err, ?state, "turn failed");
                Err(err)
            }
        }
    }

    fn stream(&self, request: ChatTurnRequest) -> EventStream {
        StreamTurn::new(self.clone(), request).into_events()
    }
}

/// Per-turn streaming state. Owns the upstream body and the parser, so
/// dropping the downstream stream drops both.
struct StreamTurn {
    engine: RelayEngine,
    request: ChatTurnRequest,
    state: TurnState,
    upstream: Option<ByteStream>,
    delegated: Option<EventStream>,
    parser: SseFrameParser,
    pending: VecDeque<DownstreamEvent>,
    accumulated: String,
    started: Instant,
}

impl StreamTurn {
    fn new(engine: RelayEngine, request: ChatTurnRequest) -> Self {
        let parser = SseFrameParser::with_limits(engine.limits);
        Self {
            engine,
            request,
            state: TurnState::Idle,
            upstream: None,
            delegated: None,
            parser,
            pending: VecDeque::new(),
            accumulated: String::new(),
            started: Instant::now(),
        }
    }

    fn into_events(self) -> EventStream {
        stream::unfold(self, |mut turn| async move {
            let event = turn.next_event().await?;
            Some((event, turn))
        })
        .boxed()
    }

    async fn next_event(&mut self) -> Option<DownstreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.state {
                TurnState::Completed | TurnState::Failed | TurnState::Buffered => return None,
                TurnState::Idle => {
                    if let Err(err) = self.request.validate() {
                        return Some(self.fail(err));
                    }
                    match self.engine.upstream.tokens().ensure_token().await {
                        Ok(_) => self.state = TurnState::TokenReady,
                        Err(err) => {
                            if let Some(event) = self.fail_or_delegate(err) {
                                return Some(event);
                            }
                        }
                    }
                }
                TurnState::TokenReady => {
                    match self.engine.upstream.open_stream(&self.request.message).await {
                        Ok(upstream) => {
                            self.upstream = Some(upstream);
                            self.state = TurnState::Streaming;
                        }
                        Err(err) => {
                            if let Some(event) = self.fail_or_delegate(err) {
                                return Some(event);
                            }
                        }
                    }
                }
                TurnState::Delegated => {
                    let delegated = self.delegated.as_mut()?;
                    let event = delegated.next().await;
                    if event.as_ref().is_none_or(DownstreamEvent::is_terminal) {
                        self.state = TurnState::Completed;
                        self.delegated = None;
                    }
                    return event;
                }
                TurnState::Streaming => {
                    let Some(upstream) = self.upstream.as_mut() else {
                        return Some(self.fail(RelayError::InvalidResponse(
                            "upstream stream missing".to_string(),
                        )));
                    };
                    match upstream.next().await {
                        Some(Ok(bytes)) => match self.parser.feed(&bytes) {
                            Ok(events) => self.absorb(events),
                            Err(err) => return Some(self.fail(err)),
                        },
                        Some(Err(err)) => return Some(self.fail(err)),
                        None => {
                            let events = self.parser.finalize();
                            self.absorb(events);
                            if !self.state.is_finished() {
                                tracing::debug!("upstream closed without a terminal event");
                                self.finish();
                            }
                        }
                    }
                }
            }
        }
    }

    fn absorb(&mut self, events: Vec<UpstreamEvent>) {
        for event in events {
            match event {
                UpstreamEvent::Delta { text } => {
                    self.accumulated.push_str(&text);
                    self.pending
                        .push_back(DownstreamEvent::delta(text, self.accumulated.clone()));
                }
                UpstreamEvent::Finish { reason } => {
                    tracing::debug!(finish_reason = %reason, "upstream finished");
                    self.finish();
                    return;
                }
                UpstreamEvent::Done => {
                    self.finish();
                    return;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.state = TurnState::Completed;
        self.upstream = None;
        tracing::info!(
            dialog_id = %self.request.dialog_id,
            stream = true,
            chars = self.accumulated.chars().count(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "turn completed"
        );
        self.pending
            .push_back(DownstreamEvent::completed(self.accumulated.clone()));
    }

    fn fail(&mut self, err: RelayError) -> DownstreamEvent {
        tracing::warn!(
            dialog_id = %self.request.dialog_id,
            stream = true,
            state = ?self.state,
            error = %err,
            "turn failed"
        );
        self.state = TurnState::Failed;
        self.upstream = None;
        self.pending.clear();
        DownstreamEvent::failed(err.to_string())
    }

    /// Nothing has been emitted yet in the states that call this, so handing
    /// the turn to the fallback keeps the single-terminal contract.
    fn fail_or_delegate(&mut self, err: RelayError) -> Option<DownstreamEvent> {
        match self.engine.fallback_for(&err) {
            Some(fallback) => {
                tracing::warn!(
                    dialog_id = %self.request.dialog_id,
                    error = %err,
                    "upstream unavailable; streaming from fallback"
                );
                self.delegated = Some(fallback.stream(self.request.clone()));
                self.state = TurnState::Delegated;
                None
            }
            None => Some(self.fail(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, TokenProvider};
    use crate::utils::test_support::{delta_payload, should_skip_httpmock, upstream_sse};
    use bytes::Bytes;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn engine_with_cached_token(server: &MockServer) -> Result<RelayEngine> {
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenProvider::new(
            http.clone(),
            server.url("/api/v2/oauth"),
            "api-key",
            "GIGACHAT_API_PERS",
        )?);
        tokens.store(AccessToken::new("tok-1")).await;
        let upstream = UpstreamClient::new(http, tokens).with_base_url(server.url("/api/v1"));
        Ok(RelayEngine::new(upstream))
    }

    async fn mock_stream_body(server: &MockServer, body: String) {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;
    }

    fn assert_monotone(events: &[DownstreamEvent]) {
        let mut previous = String::new();
        for event in events.iter().filter(|event| !event.is_error()) {
            let accumulated = event.accumulated.clone().unwrap_or_default();
            assert!(accumulated.starts_with(&previous), "{previous:?} -> {accumulated:?}");
            previous = accumulated;
        }
    }

    #[tokio::test]
    async fn stream_accumulates_and_completes_once() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let body = upstream_sse(&[
            delta_payload("Hel"),
            delta_payload("lo"),
            json!({ "choices": [{ "delta": { "content": "!" }, "finish_reason": "stop" }] }),
        ]);
        mock_stream_body(&server, body).await;

        let engine = engine_with_cached_token(&server).await?;
        let events: Vec<_> = engine
            .stream(ChatTurnRequest::new("hi").streaming())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                DownstreamEvent::delta("Hel", "Hel"),
                DownstreamEvent::delta("lo", "Hello"),
                DownstreamEvent::delta("!", "Hello!"),
                DownstreamEvent::completed("Hello!"),
            ]
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_monotone(&events);
        Ok(())
    }

    #[tokio::test]
    async fn silent_close_synthesizes_completion() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let body = format!(
            "data: {}\n\ndata: {{\"choices\":[{{\"delta\":{{\"content\":\"cut",
            delta_payload("partial")
        );
        mock_stream_body(&server, body).await;

        let engine = engine_with_cached_token(&server).await?;
        let events: Vec<_> = engine.stream(ChatTurnRequest::new("hi")).collect().await;

        assert_eq!(
            events,
            vec![
                DownstreamEvent::delta("partial", "partial"),
                DownstreamEvent::completed("partial"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn upstream_error_becomes_single_error_event() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/chat/completions");
                then.status(503).body("overloaded");
            })
            .await;

        let engine = engine_with_cached_token(&server).await?;
        let events: Vec<_> = engine.stream(ChatTurnRequest::new("hi")).collect().await;

        assert_eq!(events.len(), 1);
        let error = events[0].error.clone().unwrap_or_default();
        assert!(error.contains("503"), "{error}");
        assert!(error.contains("overloaded"), "{error}");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_line_fails_the_stream() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        mock_stream_body(&server, format!("data: {}", "x".repeat(512))).await;

        let engine = engine_with_cached_token(&server)
            .await?
            .with_sse_limits(SseLimits { max_line_bytes: 128 });
        let events: Vec<_> = engine.stream(ChatTurnRequest::new("hi")).collect().await;

        assert_eq!(events.len(), 1, "{events:?}");
        let error = events[0].error.clone().unwrap_or_default();
        assert!(error.contains("max_line_bytes"), "{error}");
        Ok(())
    }

    #[tokio::test]
    async fn buffered_turn_returns_reply() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"choices":[{"message":{"content":"hi there"}}]}"#);
            })
            .await;

        let engine = engine_with_cached_token(&server).await?;
        let reply = engine.complete(&ChatTurnRequest::new("hello")).await?;
        assert_eq!(reply.response, "hi there");
        Ok(())
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_upstream() -> Result<()> {
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenProvider::new(http.clone(), "http://127.0.0.1:9/oauth", "k", "s")?);
        let engine = RelayEngine::new(UpstreamClient::new(http, tokens));

        let err = engine.complete(&ChatTurnRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));

        let events: Vec<_> = engine.stream(ChatTurnRequest::new("")).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_upstream_uses_fallback_when_enabled() -> Result<()> {
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenProvider::new(http.clone(), "http://127.0.0.1:9/oauth", "k", "s")?);
        let upstream = UpstreamClient::new(http, tokens).with_base_url("http://127.0.0.1:9/api/v1");

        let plain = RelayEngine::new(upstream.clone());
        let err = plain.complete(&ChatTurnRequest::new("hello")).await.unwrap_err();
        assert!(err.is_unavailable(), "{err:?}");

        let engine = RelayEngine::new(upstream).with_fallback(
            FallbackResponder::new()
                .without_delays()
                .with_note_probability(0.0),
        );
        let reply = engine.complete(&ChatTurnRequest::new("hello")).await?;
        assert!(reply.response.starts_with("Привет!"));

        let events: Vec<_> = engine.stream(ChatTurnRequest::new("hello")).collect().await;
        let last = events.last().cloned().unwrap_or_default();
        assert!(last.is_done());
        assert_eq!(last.accumulated.as_deref(), Some(reply.response.as_str()));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_monotone(&events);
        Ok(())
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dropping_downstream_releases_upstream_without_reading_ahead() -> Result<()> {
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenProvider::new(http.clone(), "http://127.0.0.1:9/oauth", "k", "s")?);
        let engine = RelayEngine::new(UpstreamClient::new(http, tokens));

        let dropped = Arc::new(AtomicBool::new(false));
        let polled = Arc::new(AtomicUsize::new(0));
        let guard = DropFlag(dropped.clone());
        let counter = polled.clone();
        let first = Bytes::from(format!("data: {}\n\n", delta_payload("Hi")));
        let second = Bytes::from(format!("data: {}\n\n", delta_payload(" there")));
        let upstream: ByteStream = stream::iter([Ok::<Bytes, RelayError>(first), Ok(second)])
            .chain(stream::pending())
            .map(move |chunk| {
                let _held = &guard;
                counter.fetch_add(1, Ordering::SeqCst);
                chunk
            })
            .boxed();

        let mut events = engine.relay_upstream(ChatTurnRequest::new("hi").streaming(), upstream);
        assert_eq!(events.next().await, Some(DownstreamEvent::delta("Hi", "Hi")));
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(events);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn finished_states() {
        assert!(TurnState::Completed.is_finished());
        assert!(TurnState::Failed.is_finished());
        assert!(!TurnState::Streaming.is_finished());
    }
}
