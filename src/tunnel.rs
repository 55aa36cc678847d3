use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::TunnelConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Public base URL the process is reachable under. Written once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEndpoint(String);

impl PublicEndpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let parsed =
            reqwest::Url::parse(url).with_context(|| format!("Invalid public URL: {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("Public URL must be http or https: {url}");
        }
        Ok(Self(url.trim_end_matches('/').to_string()))
    }

    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `path` must start with `/`.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.0, path)
    }
}

impl fmt::Display for PublicEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that can make a local port reachable from the internet.
#[async_trait]
pub trait TunnelProvisioner: Send + Sync {
    async fn provision(&self, local_port: u16) -> Result<PublicEndpoint>;
}

/// Uses a URL the operator already exposes (reverse proxy, PaaS hostname).
pub struct StaticTunnel {
    url: String,
}

impl StaticTunnel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TunnelProvisioner for StaticTunnel {
    async fn provision(&self, _local_port: u16) -> Result<PublicEndpoint> {
        PublicEndpoint::parse(&self.url)
    }
}

/// Runs the `ngrok` agent and reads the assigned URL from its local API.
pub struct NgrokTunnel {
    bin: String,
    api_url: String,
    authtoken: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
    /// Held for the lifetime of the process; dropping it kills the agent.
    child: Mutex<Option<Child>>,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    public_url: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    config: Option<TunnelInfoConfig>,
}

#[derive(Debug, Deserialize)]
struct TunnelInfoConfig {
    #[serde(default)]
    addr: String,
}

impl NgrokTunnel {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            bin: config.ngrok_bin.clone(),
            api_url: config.ngrok_api.trim_end_matches('/').to_string(),
            authtoken: config.ngrok_authtoken.clone(),
            timeout: Duration::from_secs(config.startup_timeout_secs),
            http: reqwest::Client::new(),
            child: Mutex::new(None),
        }
    }

    fn agent_command(&self, local_port: u16) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("http")
            .arg(local_port.to_string())
            .args(["--log", "stdout"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = &self.authtoken {
            cmd.env("NGROK_AUTHTOKEN", token);
        }
        cmd
    }

    async fn spawn_agent(&self, local_port: u16) -> Result<()> {
        let mut child = self
            .agent_command(local_port)
            .spawn()
            .with_context(|| format!("Failed to start tunnel agent: {}", self.bin))?;
        debug!("Started tunnel agent (pid {:?})", child.id());

        // Drain the agent's log so the pipe never fills up.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "wakerelay::ngrok", "{}", line);
                }
            });
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Poll the agent API until it reports an https tunnel for `local_port`.
    async fn wait_for_public_url(&self, local_port: u16) -> Result<String> {
        let url = format!("{}/api/tunnels", self.api_url);
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            if let Some(child) = self.child.lock().await.as_mut() {
                if let Some(status) = child.try_wait()? {
                    bail!("Tunnel agent exited early with {}", status);
                }
            }

            match self.fetch_tunnels(&url).await {
                Ok(list) => {
                    if let Some(public_url) = find_public_url(&list, local_port) {
                        return Ok(public_url);
                    }
                    debug!("Tunnel agent up, no tunnel for port {} yet", local_port);
                }
                Err(e) => debug!("Tunnel agent API not ready: {:#}", e),
            }

            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "No public URL from tunnel agent at {} within {}s",
                    self.api_url,
                    self.timeout.as_secs()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fetch_tunnels(&self, url: &str) -> Result<TunnelList> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to reach tunnel agent API")?
            .error_for_status()?;
        response
            .json()
            .await
            .context("Failed to parse tunnel agent response")
    }
}

fn find_public_url(list: &TunnelList, local_port: u16) -> Option<String> {
    let suffix = format!(":{}", local_port);
    list.tunnels
        .iter()
        .filter(|t| t.proto == "https" || t.public_url.starts_with("https://"))
        .find(|t| match &t.config {
            Some(config) => {
                config.addr.ends_with(&suffix) || config.addr == local_port.to_string()
            }
            None => true,
        })
        .map(|t| t.public_url.clone())
}

#[async_trait]
impl TunnelProvisioner for NgrokTunnel {
    async fn provision(&self, local_port: u16) -> Result<PublicEndpoint> {
        self.spawn_agent(local_port).await?;
        let public_url = self.wait_for_public_url(local_port).await?;
        let endpoint = PublicEndpoint::parse(&public_url)?;
        info!(
            "ngrok tunnel \"{}\" -> \"http://127.0.0.1:{}\"",
            endpoint, local_port
        );
        Ok(endpoint)
    }
}

/// Pick the provisioner from config: a fixed URL wins over the agent.
pub fn from_config(config: &TunnelConfig) -> Box<dyn TunnelProvisioner> {
    match &config.public_url {
        Some(url) => Box::new(StaticTunnel::new(url.clone())),
        None => Box::new(NgrokTunnel::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNELS_JSON: &str = r#"{
        "tunnels": [
            {"name": "cmd-http", "public_url": "http://abc.ngrok.io", "proto": "http",
             "config": {"addr": "http://localhost:5000", "inspect": true}},
            {"name": "cmd", "public_url": "https://abc.ngrok.io", "proto": "https",
             "config": {"addr": "http://localhost:5000", "inspect": true}},
            {"name": "other", "public_url": "https://other.ngrok.io", "proto": "https",
             "config": {"addr": "http://localhost:8080", "inspect": true}}
        ],
        "uri": "/api/tunnels"
    }"#;

    fn agent_for(api_url: &str, timeout_secs: u64) -> NgrokTunnel {
        NgrokTunnel::new(&TunnelConfig {
            ngrok_api: api_url.to_string(),
            startup_timeout_secs: timeout_secs,
            ..TunnelConfig::default()
        })
    }

    #[test]
    fn test_public_endpoint_trims_and_joins() {
        let endpoint = PublicEndpoint::parse("https://abc.ngrok.io/").unwrap();
        assert_eq!(endpoint.as_str(), "https://abc.ngrok.io");
        assert_eq!(endpoint.join("/wake-up"), "https://abc.ngrok.io/wake-up");
    }

    #[test]
    fn test_public_endpoint_rejects_garbage() {
        assert!(PublicEndpoint::parse("not a url").is_err());
        assert!(PublicEndpoint::parse("ws://abc.ngrok.io").is_err());
    }

    #[test]
    fn test_find_public_url_prefers_https_for_port() {
        let list: TunnelList = serde_json::from_str(TUNNELS_JSON).unwrap();
        assert_eq!(
            find_public_url(&list, 5000).as_deref(),
            Some("https://abc.ngrok.io")
        );
        assert_eq!(
            find_public_url(&list, 8080).as_deref(),
            Some("https://other.ngrok.io")
        );
        assert_eq!(find_public_url(&list, 9999), None);
    }

    #[tokio::test]
    async fn test_static_tunnel() {
        let endpoint = StaticTunnel::new("https://relay.example.com")
            .provision(5000)
            .await
            .unwrap();
        assert_eq!(endpoint.as_str(), "https://relay.example.com");
    }

    #[tokio::test]
    async fn test_wait_reads_agent_api() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tunnels")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(TUNNELS_JSON)
            .create_async()
            .await;

        let url = agent_for(&server.url(), 5)
            .wait_for_public_url(5000)
            .await
            .unwrap();
        assert_eq!(url, "https://abc.ngrok.io");
    }

    #[tokio::test]
    async fn test_wait_times_out_without_tunnel() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tunnels")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"tunnels": []}"#)
            .create_async()
            .await;

        let err = agent_for(&server.url(), 0)
            .wait_for_public_url(5000)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No public URL"));
    }

    #[test]
    fn test_agent_command_logs_to_stdout() {
        let tunnel = NgrokTunnel::new(&TunnelConfig {
            ngrok_authtoken: Some("secret".to_string()),
            ..TunnelConfig::default()
        });
        let cmd = tunnel.agent_command(5000);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ngrok");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["http", "5000", "--log", "stdout"]);
        assert!(std_cmd
            .get_envs()
            .any(|(k, v)| k == "NGROK_AUTHTOKEN" && v == Some(std::ffi::OsStr::new("secret"))));
    }

    #[tokio::test]
    async fn test_missing_agent_binary_fails() {
        let tunnel = NgrokTunnel::new(&TunnelConfig {
            ngrok_bin: "/nonexistent/ngrok-binary".to_string(),
            startup_timeout_secs: 0,
            ..TunnelConfig::default()
        });
        assert!(tunnel.provision(5000).await.is_err());
    }

    #[tokio::test]
    async fn test_from_config_static_when_url_set() {
        let config = TunnelConfig {
            public_url: Some("https://relay.example.com".to_string()),
            ..TunnelConfig::default()
        };
        let endpoint = from_config(&config).provision(5000).await.unwrap();
        assert_eq!(endpoint.as_str(), "https://relay.example.com");
    }
}
