//! Shared types for transport implementations.

use std::fmt;

/// Identifier of a chat, the unit of authorization and reply addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Monotonic update identifier
    pub id: u32,
    /// Originating chat; `None` for updates that are not tied to a chat
    pub conversation_id: Option<ConversationId>,
    /// Message body, empty for non-text updates
    pub text: String,
}

impl InboundMessage {
    /// Create a text message from a chat.
    pub fn new(id: u32, conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            id,
            conversation_id: Some(conversation_id),
            text: text.into(),
        }
    }
}

/// How a reply's text should be interpreted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Formatting {
    #[default]
    Plain,
    MarkdownV2,
}

/// A command published to the chat client's command menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command name without the leading slash
    pub command: &'static str,
    pub description: &'static str,
}
