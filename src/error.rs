use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid credentials")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to get access token ({status}): {body}")]
    UpstreamAuth { status: StatusCode, body: String },
    #[error("connection error: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream api error ({status}): {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Status reported to a buffered-mode caller: the upstream status when one
    /// is known, otherwise 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Api { status, .. } => *status,
            Self::UpstreamAuth { .. }
            | Self::UpstreamUnavailable(_)
            | Self::InvalidResponse(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::InvalidResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::Api {
                status,
                body: err.to_string(),
            };
        }
        Self::UpstreamUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
