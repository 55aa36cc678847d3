use thiserror::Error;

/// Fatal failures of the provision → register sequence. The variants are
/// kept apart so logs show which side of startup broke.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("tunnel provisioning failed: {0:#}")]
    Provisioning(anyhow::Error),
    #[error("webhook registration failed: {0:#}")]
    Registration(anyhow::Error),
}

impl StartupError {
    pub fn domain(&self) -> &'static str {
        match self {
            StartupError::Provisioning(_) => "provisioning",
            StartupError::Registration(_) => "registration",
        }
    }
}

/// Per-request failure; surfaces as HTTP 500 and never stops the server.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid update payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has text but no chat to reply to")]
    MissingChat,
    #[error("send message failed: {0:#}")]
    Send(anyhow::Error),
}
