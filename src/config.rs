use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::{RelayError, Result};

pub const DEFAULT_AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_BASE_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";
pub const DEFAULT_MODEL: &str = "GigaChat";

/// Settings layer read from a `.env` file, consulted before the process
/// environment.
///
/// A key assigned a blank value in the file (`GIGACHAT_API_KEY=`) is kept and
/// shadows the process variable, so a `.env` can force the offline fallback
/// even when the shell exports a key.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(String::as_str).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    /// Reads a `.env` file if it exists; a missing file yields an empty layer.
    pub async fn load_dotenv(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Self::parse_dotenv(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Trimmed, non-blank value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let raw = match self.dotenv.get(key) {
            Some(value) => value.clone(),
            None => std::env::var(key).ok()?,
        };
        let value = raw.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

/// Parses `KEY=value` lines. Supports `export ` prefixes, `#` comments (whole
/// line, or trailing after an unquoted value), single quotes taken literally
/// and double quotes with `\n`, `\"` and `\\` escapes. Lines with keys that
/// are not `[A-Za-z0-9_]+` are ignored.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        out.insert(key.to_string(), dotenv_value(value.trim()));
    }
    out
}

fn dotenv_value(raw: &str) -> String {
    if let Some(inner) = raw.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        return inner.to_string();
    }
    if let Some(inner) = raw.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

/// Runtime settings for the relay. Every field has a default so a TOML file
/// only needs to name what it changes; environment keys win over the file.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_key: Option<String>,
    pub auth_url: String,
    pub base_url: String,
    pub scope: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub tls_insecure: bool,
    pub fallback_on_unavailable: bool,
    pub listen: String,
    pub users: BTreeMap<String, String>,
    pub cors_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            auth_url: DEFAULT_AUTH_URL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            timeout_secs: 30,
            tls_insecure: false,
            fallback_on_unavailable: false,
            listen: "0.0.0.0:8000".to_string(),
            users: default_users(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:8000".to_string(),
                "tauri://localhost".to_string(),
                "http://localhost:4173".to_string(),
            ],
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users: Vec<&str> = self.users.keys().map(|name| name.as_str()).collect();
        f.debug_struct("RelayConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("auth_url", &self.auth_url)
            .field("base_url", &self.base_url)
            .field("scope", &self.scope)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("tls_insecure", &self.tls_insecure)
            .field("fallback_on_unavailable", &self.fallback_on_unavailable)
            .field("listen", &self.listen)
            .field("users", &users)
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

fn default_users() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("admin".to_string(), "password123".to_string()),
        ("user".to_string(), "chat123".to_string()),
    ])
}

impl RelayConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| RelayError::Config(err.to_string()))
    }

    /// Builds the effective config: defaults, then the optional TOML file, then `env`.
    pub async fn load(path: Option<&Path>, env: &Env) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
                    RelayError::Config(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &Env) -> Result<()> {
        if let Some(value) = env.get("GIGACHAT_API_KEY") {
            self.api_key = Some(value);
        }
        if let Some(value) = env.get("GIGACHAT_AUTH_URL") {
            self.auth_url = value;
        }
        if let Some(value) = env.get("GIGACHAT_BASE_URL") {
            self.base_url = value;
        }
        if let Some(value) = env.get("GIGACHAT_SCOPE") {
            self.scope = value;
        }
        if let Some(value) = env.get("GIGACHAT_MODEL") {
            self.model = value;
        }
        if let Some(value) = env.get("RELAY_TEMPERATURE") {
            self.temperature = parse_number("RELAY_TEMPERATURE", &value)?;
        }
        if let Some(value) = env.get("RELAY_MAX_TOKENS") {
            self.max_tokens = parse_number("RELAY_MAX_TOKENS", &value)?;
        }
        if let Some(value) = env.get("RELAY_TIMEOUT_SECS") {
            self.timeout_secs = parse_number("RELAY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env.get("RELAY_TLS_INSECURE") {
            self.tls_insecure = parse_flag("RELAY_TLS_INSECURE", &value)?;
        }
        if let Some(value) = env.get("RELAY_FALLBACK_ON_UNAVAILABLE") {
            self.fallback_on_unavailable = parse_flag("RELAY_FALLBACK_ON_UNAVAILABLE", &value)?;
        }
        if let Some(value) = env.get("RELAY_LISTEN") {
            self.listen = value;
        }
        if let Some(value) = env.get("RELAY_USERS") {
            self.users = parse_users(&value)?;
        }
        if let Some(value) = env.get("RELAY_CORS_ORIGINS") {
            self.cors_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_url.trim().is_empty() {
            return Err(RelayError::Config("auth_url is required".to_string()));
        }
        if self.base_url.trim().is_empty() {
            return Err(RelayError::Config("base_url is required".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(RelayError::Config("model is required".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(RelayError::Config("timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }

    /// The key only counts when it is non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.trim().is_empty())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Shared upstream HTTP client: connect timeout only, request timeouts are
    /// applied per call so streaming responses are not cut off.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.timeout())
            .danger_accept_invalid_certs(self.tls_insecure)
            .build()
            .map_err(|err| RelayError::Config(format!("failed to build http client: {err}")))?;
        Ok(http)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| RelayError::Config(format!("invalid {key}: {raw}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RelayError::Config(format!("invalid {key}: {raw}"))),
    }
}

fn parse_users(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, password)) = entry.split_once(':') else {
            return Err(RelayError::Config(format!(
                "invalid RELAY_USERS entry (expected name:password): {entry}"
            )));
        };
        let name = name.trim();
        if name.is_empty() || password.is_empty() {
            return Err(RelayError::Config(format!(
                "invalid RELAY_USERS entry (expected name:password): {entry}"
            )));
        }
        out.insert(name.to_string(), password.to_string());
    }
    Ok(out)
}
