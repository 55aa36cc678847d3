use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::error::StartupError;
use crate::telegram::MessagingClient;
use crate::tunnel::{PublicEndpoint, TunnelProvisioner};

pub const WEBHOOK_PATH: &str = "/telegram";

/// How often to retry the whole provision → register sequence.
/// `max_attempts == 1` means fail on the first error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): exponential backoff
    /// plus uniform jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.backoff.saturating_mul(1 << exp);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        base + jitter
    }
}

/// Register `<endpoint>/telegram` as the bot's webhook.
pub async fn register_webhook(
    client: &dyn MessagingClient,
    endpoint: &PublicEndpoint,
) -> Result<String, StartupError> {
    let webhook_url = endpoint.join(WEBHOOK_PATH);
    match client.set_webhook(&webhook_url).await {
        Ok(()) => {
            info!("Webhook set up at {}", webhook_url);
            Ok(webhook_url)
        }
        Err(e) => {
            error!("Failed to set webhook: {:#}", e);
            Err(StartupError::Registration(e))
        }
    }
}

async fn attempt(
    tunnel: &dyn TunnelProvisioner,
    client: &dyn MessagingClient,
    local_port: u16,
) -> Result<PublicEndpoint, StartupError> {
    let endpoint = tunnel
        .provision(local_port)
        .await
        .map_err(StartupError::Provisioning)?;
    register_webhook(client, &endpoint).await?;
    Ok(endpoint)
}

/// Provision the tunnel, then register the webhook. Registration only runs
/// after provisioning succeeded within the same attempt.
pub async fn run(
    tunnel: &dyn TunnelProvisioner,
    client: &dyn MessagingClient,
    local_port: u16,
    policy: &RetryPolicy,
) -> Result<PublicEndpoint, StartupError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_no = 1;
    loop {
        match attempt(tunnel, client, local_port).await {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) if attempt_no < max_attempts => {
                let delay = policy.delay(attempt_no);
                warn!(
                    domain = e.domain(),
                    "Startup attempt {}/{} failed: {}; retrying in {:?}",
                    attempt_no,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt_no += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
