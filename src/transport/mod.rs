//! Messaging transport abstraction.
//!
//! The dispatch loop and tunnel manager only talk to the chat backend
//! through the [`Transport`] trait: long-poll for updates, send a text
//! reply, publish the command menu.

mod types;

pub mod telegram;

pub use telegram::escape_code;
pub use types::{CommandSpec, ConversationId, Formatting, InboundMessage};

use crate::error::TransportError;
use async_trait::async_trait;

/// Abstraction over the chat backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Long-poll for messages with `id >= cursor`.
    ///
    /// Waits up to `timeout_seconds` for new messages. An empty batch is a
    /// normal timeout, not an error.
    async fn poll(
        &self,
        cursor: u32,
        timeout_seconds: u32,
    ) -> Result<Vec<InboundMessage>, TransportError>;

    /// Send a text message to a conversation.
    async fn send_text(
        &self,
        conversation: ConversationId,
        text: &str,
        formatting: Formatting,
    ) -> Result<(), TransportError>;

    /// Publish the command menu for a single conversation.
    async fn register_commands(
        &self,
        conversation: ConversationId,
        commands: &[CommandSpec],
    ) -> Result<(), TransportError>;

    /// Get the platform name for logging purposes.
    fn platform_name(&self) -> &'static str;

    /// Send a reply, logging instead of returning a failure.
    async fn reply(&self, conversation: ConversationId, text: &str, formatting: Formatting) {
        if let Err(e) = self.send_text(conversation, text, formatting).await {
            tracing::warn!(
                "Failed to send reply to {} via {}: {}",
                conversation,
                self.platform_name(),
                e
            );
        }
    }
}
