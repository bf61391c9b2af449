//! Telegram transport implementation.
//!
//! Long-polls `getUpdates`, replies with `sendMessage` and publishes the
//! command menu with `setMyCommands` scoped to each allowed chat.

use super::{CommandSpec, ConversationId, Formatting, InboundMessage, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, BotCommandScope, ParseMode, Recipient, UpdateKind};

/// Telegram Bot API transport.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    /// Create a new Telegram transport.
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn poll(
        &self,
        cursor: u32,
        timeout_seconds: u32,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let updates = self
            .bot
            .get_updates()
            .offset(update_offset(cursor)?)
            .timeout(timeout_seconds)
            .await?;

        Ok(updates.into_iter().map(to_inbound).collect())
    }

    async fn send_text(
        &self,
        conversation: ConversationId,
        text: &str,
        formatting: Formatting,
    ) -> Result<(), TransportError> {
        let request = self.bot.send_message(ChatId(conversation.0), text);
        match formatting {
            Formatting::Plain => request.await?,
            Formatting::MarkdownV2 => request.parse_mode(ParseMode::MarkdownV2).await?,
        };
        Ok(())
    }

    async fn register_commands(
        &self,
        conversation: ConversationId,
        commands: &[CommandSpec],
    ) -> Result<(), TransportError> {
        let commands = commands
            .iter()
            .map(|c| BotCommand::new(c.command, c.description));

        self.bot
            .set_my_commands(commands)
            .scope(BotCommandScope::Chat {
                chat_id: Recipient::Id(ChatId(conversation.0)),
            })
            .await?;
        Ok(())
    }

    fn platform_name(&self) -> &'static str {
        "Telegram"
    }
}

/// `getUpdates` takes a signed offset; negative values mean "last N updates".
fn update_offset(cursor: u32) -> Result<i32, TransportError> {
    i32::try_from(cursor).map_err(|_| TransportError::OffsetOutOfRange(cursor))
}

/// Convert a Telegram update into an [`InboundMessage`].
///
/// Every update is kept so the cursor advances past it. Only new messages
/// carry a conversation; edits, channel posts, callbacks and membership
/// changes come back without one and fail authorization.
fn to_inbound(update: Update) -> InboundMessage {
    let (conversation_id, text) = match &update.kind {
        UpdateKind::Message(message) => (
            Some(ConversationId(message.chat.id.0)),
            message.text().unwrap_or_default().to_string(),
        ),
        _ => (None, String::new()),
    };

    InboundMessage {
        id: update.id.0,
        conversation_id,
        text,
    }
}

/// Escape text placed inside a MarkdownV2 `code` span.
///
/// Only backtick and backslash are special there.
pub fn escape_code(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            result.push('\\');
        }
        result.push(c);
    }
    result
}
