use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::header::{
    ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, WWW_AUTHENTICATE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::auth::{BasicCredentials, UserTable};
use crate::relay::ChatRelay;
use crate::types::ChatTurnRequest;
use crate::{RelayError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Upstream,
    Fallback,
}

#[derive(Clone)]
pub struct HttpState {
    relay: Arc<dyn ChatRelay>,
    users: Arc<UserTable>,
    mode: ServiceMode,
}

impl HttpState {
    pub fn new(relay: Arc<dyn ChatRelay>, users: UserTable, mode: ServiceMode) -> Self {
        Self {
            relay,
            users: Arc::new(users),
            mode,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: ServiceMode,
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: &'static str,
    user: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

/// Error reply in the `{"detail": ...}` shape.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorBody {
                detail: self.detail,
            }),
        )
            .into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        }
        response
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/request", post(handle_request))
        .with_state(state)
}

/// CORS for the configured browser origins. Credentials are allowed, so
/// methods and headers are listed explicitly.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| RelayError::Config(format!("invalid CORS origin: {origin}")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT])
        .allow_credentials(true))
}

fn authenticate(state: &HttpState, headers: &HeaderMap) -> std::result::Result<String, ApiError> {
    let credentials = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(BasicCredentials::from_header_value)
        .ok_or(RelayError::Unauthorized)?;
    if !state.users.authenticate(&credentials) {
        tracing::info!(username = %credentials.username, "rejected credentials");
        return Err(RelayError::Unauthorized.into());
    }
    Ok(credentials.username)
}

async fn handle_health(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mode: state.mode,
    })
}

async fn handle_root(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> std::result::Result<Json<RootResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(RootResponse {
        message: "Chat Proxy API",
        user,
    }))
}

async fn handle_request(
    State(state): State<HttpState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ChatTurnRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let user = authenticate(&state, &headers)?;
    let Json(request) = payload.map_err(|rejection| {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    })?;
    request.validate()?;

    tracing::info!(
        user = %user,
        dialog_id = %request.dialog_id,
        stream = request.stream,
        "chat request"
    );

    if !request.stream {
        let reply = state.relay.complete(&request).await?;
        return Ok(Json(reply).into_response());
    }

    let frames = state
        .relay
        .stream(request)
        .map(|event| event.to_sse_frame().map_err(std::io::Error::other));
    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}
