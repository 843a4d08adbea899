mod error;

pub mod auth;
pub mod config;
pub mod fallback;
pub mod http;
pub mod logging;
pub mod relay;
pub mod sse;
pub mod types;
pub mod upstream;
pub mod utils;

pub use auth::{AccessToken, BasicCredentials, TokenProvider, UserTable};
pub use config::{Env, RelayConfig, parse_dotenv};
pub use error::{RelayError, Result};
pub use fallback::FallbackResponder;
pub use http::{HttpState, ServiceMode, cors_layer, router};
pub use relay::{ChatRelay, EventStream, RelayEngine, TurnState};
pub use sse::{SseFrameParser, SseLimits};
pub use types::{ChatReply, ChatTurnRequest, DownstreamEvent, TransportMode, UpstreamEvent};
pub use upstream::{ByteStream, UpstreamClient, UpstreamReply};
