//! Routing of inbound webhook updates to the echo and end handlers.
//!
//! Each update is handled on its own: nothing is remembered between calls,
//! so concurrent deliveries may interleave freely.

use std::fmt;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::telegram::MessagingClient;

pub const END_COMMAND: &str = "/end";
pub const FAREWELL_TEXT: &str = "Ending conversation...";
const COMMAND_PREFIX: char = '/';

/// One payload pushed by Telegram to the webhook.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InboundUpdate {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InboundMessage {
    #[serde(default)]
    pub chat: Option<InboundChat>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundChat {
    pub id: ChatIdentifier,
}

/// Reply target: a numeric chat id or a `@channel` username.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChatIdentifier {
    Id(i64),
    Username(String),
}

impl fmt::Display for ChatIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatIdentifier::Id(id) => write!(f, "{}", id),
            ChatIdentifier::Username(name) => write!(f, "{}", name),
        }
    }
}

/// Which branch handled an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Accepted without reacting: no message, no text, or an unknown command.
    Ignored,
    Echoed,
    Ended,
}

enum Route<'a> {
    End,
    Echo(&'a str),
    Ignore,
}

impl InboundUpdate {
    pub fn from_slice(body: &[u8]) -> Result<Self, DispatchError> {
        Ok(serde_json::from_slice(body)?)
    }
}

fn route(text: &str) -> Route<'_> {
    if text == END_COMMAND {
        Route::End
    } else if text.starts_with(COMMAND_PREFIX) {
        // Other commands are accepted and dropped.
        Route::Ignore
    } else {
        Route::Echo(text)
    }
}

pub fn echo_text(text: &str) -> String {
    format!("Received your message: {}", text)
}

/// Run at most one handler for `update`, issuing at most one outbound send.
pub async fn dispatch(
    client: &dyn MessagingClient,
    update: &InboundUpdate,
) -> Result<HandlerOutcome, DispatchError> {
    let Some(message) = &update.message else {
        debug!(update_id = ?update.update_id, "Update without message, ignoring");
        return Ok(HandlerOutcome::Ignored);
    };

    let text = match message.text.as_deref() {
        Some(text) if !text.is_empty() => text,
        _ => return Ok(HandlerOutcome::Ignored),
    };

    // Every text message needs a chat, even one that ends up ignored.
    let chat = reply_target(message)?;

    match route(text) {
        Route::Ignore => {
            debug!(update_id = ?update.update_id, "Unhandled command from chat {}", chat);
            Ok(HandlerOutcome::Ignored)
        }
        Route::End => {
            info!("End requested by chat {}", chat);
            send(client, chat, FAREWELL_TEXT).await?;
            Ok(HandlerOutcome::Ended)
        }
        Route::Echo(text) => {
            info!("Echoing message from chat {}", chat);
            debug!("Message text: {}", text);
            send(client, chat, &echo_text(text)).await?;
            Ok(HandlerOutcome::Echoed)
        }
    }
}

fn reply_target(message: &InboundMessage) -> Result<&ChatIdentifier, DispatchError> {
    message
        .chat
        .as_ref()
        .map(|chat| &chat.id)
        .ok_or(DispatchError::MissingChat)
}

async fn send(
    client: &dyn MessagingClient,
    chat: &ChatIdentifier,
    text: &str,
) -> Result<(), DispatchError> {
    client
        .send_message(chat, text)
        .await
        .map_err(DispatchError::Send)
}
