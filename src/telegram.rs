use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::dispatch::ChatIdentifier;

/// The two Bot API operations the relay needs. Built once in `main` and
/// handed to the dispatcher and the startup sequence.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_message(&self, chat: &ChatIdentifier, text: &str) -> Result<()>;

    async fn set_webhook(&self, url: &str) -> Result<()>;
}

/// `MessagingClient` backed by a teloxide `Bot`.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let mut bot = Bot::new(&config.bot_token);
        if let Some(url) = &config.api_url {
            let url = reqwest::Url::parse(url)
                .with_context(|| format!("Invalid Telegram API URL: {url}"))?;
            bot = bot.set_api_url(url);
        }
        Ok(Self { bot })
    }
}

impl From<&ChatIdentifier> for Recipient {
    fn from(chat: &ChatIdentifier) -> Self {
        match chat {
            ChatIdentifier::Id(id) => Recipient::Id(ChatId(*id)),
            ChatIdentifier::Username(name) => Recipient::ChannelUsername(name.clone()),
        }
    }
}

#[async_trait]
impl MessagingClient for TelegramClient {
    async fn send_message(&self, chat: &ChatIdentifier, text: &str) -> Result<()> {
        debug!("Sending message to chat {}", chat);
        self.bot
            .send_message(Recipient::from(chat), text)
            .await
            .with_context(|| format!("Failed to send message to chat {chat}"))?;
        Ok(())
    }

    async fn set_webhook(&self, url: &str) -> Result<()> {
        let url = reqwest::Url::parse(url).with_context(|| format!("Invalid webhook URL: {url}"))?;
        self.bot
            .set_webhook(url)
            .await
            .context("Telegram rejected setWebhook")?;
        Ok(())
    }
}
