mod config;
mod dispatch;
mod error;
mod liveness;
mod logging;
mod server;
mod startup;
mod telegram;
#[cfg(test)]
mod testing;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::liveness::{HttpProbe, LivenessMonitor};
use crate::server::AppState;
use crate::telegram::{MessagingClient, TelegramClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    logging::init(&config.logging)?;

    info!("Configuration loaded from: {}", config_path.display());
    info!("  Port: {}", config.server.port);
    info!(
        "  Tunnel: {}",
        config.tunnel.public_url.as_deref().unwrap_or("ngrok")
    );
    info!("  Liveness interval: {}s", config.liveness.interval_secs);

    let client: Arc<dyn MessagingClient> = Arc::new(TelegramClient::new(&config.telegram)?);

    // Tunnel first, then webhook. Either failing stops startup.
    let tunnel = tunnel::from_config(&config.tunnel);
    let endpoint = match startup::run(
        tunnel.as_ref(),
        client.as_ref(),
        config.server.port,
        &config.startup.retry_policy(),
    )
    .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(domain = e.domain(), "Failed to start server: {}", e);
            return Err(e.into());
        }
    };

    let listener = server::bind(config.server.socket_addr()?).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let probe = HttpProbe::new(&endpoint, config.liveness.request_timeout())?;
    let monitor = LivenessMonitor::new(Box::new(probe), config.liveness.interval());
    let monitor_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    let result = server::serve(listener, AppState { client }, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = monitor_task.await {
        warn!("Liveness monitor task ended abnormally: {}", e);
    }
    // Keeps the tunnel agent alive until here.
    drop(tunnel);

    result
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
