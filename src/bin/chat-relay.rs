use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chat_relay::{
    ChatRelay, Env, FallbackResponder, HttpState, RelayConfig, RelayEngine, ServiceMode,
    TokenProvider, UpstreamClient, UserTable, cors_layer, logging, router,
};

#[derive(Parser)]
#[command(name = "chat-relay", about = "Authenticated streaming proxy for GigaChat-style chat APIs")]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// dotenv file layered over the process environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Listen address, overrides RELAY_LISTEN
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_tracing(cli.json_logs)?;

    let env = Env::load_dotenv(&cli.env_file).await?;
    let mut config = RelayConfig::load(cli.config.as_deref(), &env).await?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    if config.users.is_empty() {
        tracing::warn!("no users configured; every request will be rejected");
    } else if config.users.get("admin").is_some_and(|pass| pass == "password123") {
        tracing::warn!("built-in demo users are active; set RELAY_USERS for real deployments");
    }
    if config.tls_insecure {
        tracing::warn!("upstream TLS certificate verification is disabled");
    }

    let (relay, mode): (Arc<dyn ChatRelay>, ServiceMode) = if config.api_key().is_some() {
        let http = config.http_client()?;
        let tokens = Arc::new(TokenProvider::from_config(&config, http.clone())?);
        let mut engine = RelayEngine::new(UpstreamClient::from_config(&config, http, tokens));
        if config.fallback_on_unavailable {
            engine = engine.with_fallback(FallbackResponder::new());
        }
        tracing::info!(base_url = %config.base_url, model = %config.model, "relaying to upstream");
        (Arc::new(engine), ServiceMode::Upstream)
    } else {
        tracing::warn!("GIGACHAT_API_KEY is not set; answering from the offline fallback");
        (Arc::new(FallbackResponder::new()), ServiceMode::Fallback)
    };

    let state = HttpState::new(relay, UserTable::new(config.users.clone()), mode);
    let app = router(state).layer(cors_layer(&config.cors_origins)?);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, mode = ?mode, "chat-relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("chat-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
