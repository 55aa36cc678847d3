//! Keeps the public endpoint warm by probing our own `/wake-up` route
//! through the tunnel on a fixed schedule.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tunnel::PublicEndpoint;

pub const WAKE_UP_PATH: &str = "/wake-up";

/// Result of one probe. Only ever logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    UnexpectedStatus(u16),
    TransportError(String),
}

impl ProbeOutcome {
    /// Exactly one event per outcome: info, warn or error.
    fn log(&self) {
        match self {
            ProbeOutcome::Healthy => info!("Health check successful"),
            ProbeOutcome::UnexpectedStatus(status) => {
                warn!("Health check failed with status code: {}", status)
            }
            ProbeOutcome::TransportError(reason) => error!("Health check failed: {}", reason),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// GET `<endpoint>/wake-up` over HTTP.
pub struct HttpProbe {
    http: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(endpoint: &PublicEndpoint, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build probe HTTP client")?;
        Ok(Self {
            http,
            url: endpoint.join(WAKE_UP_PATH),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.http.get(&self.url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                ProbeOutcome::Healthy
            }
            Ok(response) => ProbeOutcome::UnexpectedStatus(response.status().as_u16()),
            Err(e) => ProbeOutcome::TransportError(e.to_string()),
        }
    }
}

pub struct LivenessMonitor {
    probe: Box<dyn HealthProbe>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(probe: Box<dyn HealthProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    /// Probe, log, sleep, repeat until `cancel` fires. Returns the number of
    /// probes issued.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        debug!(
            "Liveness monitor started, probing every {}s",
            self.interval.as_secs()
        );
        let mut probes = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.probe.probe() => outcome,
            };
            probes += 1;
            outcome.log();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("Liveness monitor stopped after {} probes", probes);
        probes
    }
}
