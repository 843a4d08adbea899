use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

fn default_dialog_id() -> String {
    "default".to_string()
}

/// One chat turn as received from the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub message: String,
    #[serde(default = "default_dialog_id")]
    pub dialog_id: String,
    #[serde(default)]
    pub stream: bool,
}

impl ChatTurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            dialog_id: default_dialog_id(),
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_dialog_id(mut self, dialog_id: impl Into<String>) -> Self {
        self.dialog_id = dialog_id.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Buffered-mode reply body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Buffered,
    Streaming,
}

/// A logically complete event recovered from the upstream SSE stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamEvent {
    Delta { text: String },
    Finish { reason: String },
    Done,
}

impl UpstreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Done)
    }
}

/// One frame of the downstream event contract.
///
/// Progress frames carry `chunk`, `accumulated` and `done: false`; the
/// completion frame carries an empty `chunk` and `done: true`; a failure
/// frame carries only `error`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownstreamEvent {
    pub fn delta(chunk: impl Into<String>, accumulated: impl Into<String>) -> Self {
        Self {
            chunk: Some(chunk.into()),
            accumulated: Some(accumulated.into()),
            done: Some(false),
            error: None,
        }
    }

    pub fn completed(accumulated: impl Into<String>) -> Self {
        Self {
            chunk: Some(String::new()),
            accumulated: Some(accumulated.into()),
            done: Some(true),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.is_error()
    }

    /// Encodes the event as a single `data: <json>\n\n` SSE frame.
    pub fn to_sse_frame(&self) -> Result<Bytes> {
        let json = serde_json::to_string(self)?;
        Ok(Bytes::from(format!("data: {json}\n\n")))
    }
}
