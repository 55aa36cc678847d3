use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::{self, InboundUpdate};
use crate::liveness::WAKE_UP_PATH;
use crate::startup::WEBHOOK_PATH;
use crate::telegram::MessagingClient;

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn MessagingClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(hello))
        .route(WAKE_UP_PATH, get(wake_up))
        .route(WEBHOOK_PATH, post(telegram_webhook))
        .with_state(state)
}

async fn hello() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

async fn wake_up() -> Json<Value> {
    Json(json!({ "status": "awake" }))
}

/// Decode and dispatch one update. Any failure, including a body that does
/// not decode, is logged once and answered with an empty 500.
async fn telegram_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let result = match InboundUpdate::from_slice(&body) {
        Ok(update) => dispatch::dispatch(state.client.as_ref(), &update).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => {
            debug!("Webhook update handled: {:?}", outcome);
            StatusCode::OK
        }
        Err(e) => {
            error!("Error processing webhook: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = listener.local_addr()?.port();
    info!("Server is running on port {}", port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
