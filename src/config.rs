use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::startup::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Bot API base URL override, e.g. a local Bot API server
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// When set, no tunnel agent is started and this URL is used as-is.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_ngrok_bin")]
    pub ngrok_bin: String,
    #[serde(default = "default_ngrok_api")]
    pub ngrok_api: String,
    #[serde(default)]
    pub ngrok_authtoken: Option<String>,
    #[serde(default = "default_tunnel_timeout")]
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_error_file")]
    pub error_file: String,
    #[serde(default = "default_combined_file")]
    pub combined_file: String,
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_ngrok_bin() -> String {
    "ngrok".to_string()
}

fn default_ngrok_api() -> String {
    "http://127.0.0.1:4040".to_string()
}

fn default_tunnel_timeout() -> u64 {
    30
}

/// 14 minutes keeps free-tier hosts from idling the tunnel out.
fn default_interval() -> u64 {
    840
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    500
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_error_file() -> String {
    "error.log".to_string()
}

fn default_combined_file() -> String {
    "combined.log".to_string()
}

fn default_filter() -> String {
    "info,wakerelay=debug".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            public_url: None,
            ngrok_bin: default_ngrok_bin(),
            ngrok_api: default_ngrok_api(),
            ngrok_authtoken: None,
            startup_timeout_secs: default_tunnel_timeout(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            error_file: default_error_file(),
            combined_file: default_combined_file(),
            filter: default_filter(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl StartupConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

impl Config {
    /// Load the TOML file (if any), apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment wins over the file for the handful of values a
    /// deployment usually injects.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
        }
        if let Some(url) = lookup("PUBLIC_URL") {
            self.tunnel.public_url = Some(url);
        }
        if let Some(token) = lookup("NGROK_AUTHTOKEN") {
            self.tunnel.ngrok_authtoken = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token is empty (set it in the config file or via TOKEN)");
        }
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.liveness.interval_secs == 0 {
            bail!("liveness.interval_secs must be non-zero");
        }
        if self.liveness.request_timeout_secs == 0 {
            bail!("liveness.request_timeout_secs must be non-zero");
        }
        if self.startup.max_attempts == 0 {
            bail!("startup.max_attempts must be at least 1");
        }
        if let Some(url) = &self.tunnel.public_url {
            let parsed = reqwest::Url::parse(url)
                .with_context(|| format!("tunnel.public_url is not a valid URL: {url}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("tunnel.public_url must be http or https: {url}");
            }
        }
        if let Some(url) = &self.telegram.api_url {
            reqwest::Url::parse(url)
                .with_context(|| format!("telegram.api_url is not a valid URL: {url}"))?;
        }
        Ok(())
    }
}
