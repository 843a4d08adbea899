//! Incremental parser for the upstream completion SSE stream.
//!
//! Network chunks are split arbitrarily, so the parser keeps undecoded bytes
//! across `feed` calls and only looks at a line once its `\n` has arrived.
//! Splitting on the newline byte before decoding means a multi-byte UTF-8
//! sequence cut by a chunk boundary simply waits in the carry-over buffer.

use serde::Deserialize;

use crate::types::UpstreamEvent;
use crate::{RelayError, Result};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parser per turn; dropped with the turn.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no `\n`.
    scanned: usize,
    limits: SseLimits,
    terminated: bool,
    saw_terminal: bool,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SseLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// `true` once the `[DONE]` sentinel was seen or `finalize` ran.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// `true` once a `Done` or `Finish` event was emitted.
    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    /// Bytes held back waiting for the end of their line.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes one network chunk and returns the events it completed.
    ///
    /// Malformed lines are skipped. The only error is a line that grows past
    /// `max_line_bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<UpstreamEvent>> {
        let mut events = Vec::new();
        if self.terminated {
            return Ok(events);
        }

        self.buffer.extend_from_slice(bytes);

        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(pos) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let line_end = search_from + pos;
            let line = &self.buffer[consumed..line_end];
            consumed = line_end + 1;
            search_from = consumed;

            if line.len() > self.limits.max_line_bytes {
                return Err(line_limit_error(self.limits.max_line_bytes));
            }

            let before = events.len();
            let done = parse_line(line, &mut events);
            if events[before..].iter().any(UpstreamEvent::is_terminal) {
                self.saw_terminal = true;
            }
            if done {
                self.terminated = true;
                break;
            }
        }

        if self.terminated {
            self.buffer = Vec::new();
            self.scanned = 0;
            return Ok(events);
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.limits.max_line_bytes {
            return Err(line_limit_error(self.limits.max_line_bytes));
        }
        Ok(events)
    }

    /// Called when the transport closes. A trailing partial line is discarded,
    /// never guessed at; completion for a silent close is the caller's job.
    pub fn finalize(&mut self) -> Vec<UpstreamEvent> {
        if !self.buffer.is_empty() {
            tracing::debug!(
                bytes = self.buffer.len(),
                "discarding partial SSE line at end of stream"
            );
        }
        self.buffer = Vec::new();
        self.scanned = 0;
        self.terminated = true;
        Vec::new()
    }
}

fn line_limit_error(max: usize) -> RelayError {
    RelayError::InvalidResponse(format!("SSE line exceeds max_line_bytes={max}"))
}

/// Handles one complete line; returns `true` on the end-of-stream sentinel.
fn parse_line(raw: &[u8], events: &mut Vec<UpstreamEvent>) -> bool {
    let Ok(line) = std::str::from_utf8(raw) else {
        tracing::debug!("skipping SSE line with invalid UTF-8");
        return false;
    };
    let line = line.trim_end_matches('\r');
    let Some(payload) = line.strip_prefix("data:") else {
        return false;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return false;
    }
    if payload == DONE_SENTINEL {
        events.push(UpstreamEvent::Done);
        return true;
    }

    let parsed = match serde_json::from_str::<StreamPayload>(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed SSE payload");
            return false;
        }
    };
    let Some(choice) = parsed.choices.into_iter().next() else {
        return false;
    };

    if let Some(text) = choice
        .delta
        .and_then(|delta| delta.content)
        .filter(|text| !text.is_empty())
    {
        events.push(UpstreamEvent::Delta { text });
    }
    if let Some(reason) = choice.finish_reason {
        events.push(UpstreamEvent::Finish { reason });
    }
    false
}
