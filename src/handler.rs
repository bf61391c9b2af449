//! Executes matched actions.

use crate::rules::Action;
use crate::transport::{Formatting, InboundMessage, Transport};
use crate::tunnel::TunnelManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Something that carries out the action chosen for a message.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, action: Action, message: InboundMessage);
}

/// Replies to chat commands and drives the tunnel manager.
pub struct CommandHandler {
    transport: Arc<dyn Transport>,
    tunnels: Arc<TunnelManager>,
}

impl CommandHandler {
    pub fn new(transport: Arc<dyn Transport>, tunnels: Arc<TunnelManager>) -> Self {
        Self { transport, tunnels }
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, action: Action, message: InboundMessage) {
        if action == Action::Ignore {
            warn!("ignored: {:?}", message);
            return;
        }

        // Only unauthorized messages lack a conversation
        let Some(conversation) = message.conversation_id else {
            warn!("No conversation to answer for update {}", message.id);
            return;
        };

        match action {
            Action::Ignore => {}
            Action::Pong => {
                self.transport
                    .reply(conversation, "pong", Formatting::Plain)
                    .await;
            }
            Action::OpenReverseTunnel => {
                // The tunnel task outlives this handler
                let _ = self.tunnels.start_reverse_tunnel(conversation).await;
            }
            Action::StopTunnel => self.tunnels.stop(conversation).await,
            Action::OpenForwardingTunnel => {
                self.tunnels.start_forwarding_tunnel(conversation).await;
            }
            Action::Unknown => {
                self.transport
                    .reply(conversation, "unknown command", Formatting::Plain)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardTunnelConfig, ReverseTunnelConfig};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::ConversationId;

    fn handler() -> (Arc<RecordingTransport>, CommandHandler) {
        let transport = Arc::new(RecordingTransport::new());
        let tunnels = TunnelManager::new(
            transport.clone(),
            ReverseTunnelConfig::default(),
            ForwardTunnelConfig::default(),
        )
        .unwrap();
        let handler = CommandHandler::new(transport.clone(), Arc::new(tunnels));
        (transport, handler)
    }

    #[tokio::test]
    async fn test_pong() {
        let (transport, handler) = handler();
        handler
            .handle(Action::Pong, InboundMessage::new(1, ConversationId(5), "/ping"))
            .await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "pong");
        assert_eq!(sent[0].conversation, ConversationId(5));
        assert_eq!(sent[0].formatting, Formatting::Plain);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (transport, handler) = handler();
        handler
            .handle(Action::Unknown, InboundMessage::new(1, ConversationId(5), "/nope"))
            .await;
        assert_eq!(transport.sent_texts(), vec!["unknown command"]);
    }

    #[tokio::test]
    async fn test_ignore_sends_nothing() {
        let (transport, handler) = handler();
        handler
            .handle(Action::Ignore, InboundMessage::new(1, ConversationId(5), "/ping"))
            .await;
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_routed_to_tunnels() {
        let (transport, handler) = handler();
        handler
            .handle(
                Action::StopTunnel,
                InboundMessage::new(1, ConversationId(5), "/stopconnecting"),
            )
            .await;
        assert_eq!(transport.sent_texts(), vec!["already stopped", "stopping..."]);
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_panic() {
        let transport = Arc::new(RecordingTransport::failing_sends());
        let tunnels = TunnelManager::new(
            transport.clone(),
            ReverseTunnelConfig::default(),
            ForwardTunnelConfig::default(),
        )
        .unwrap();
        let handler = CommandHandler::new(transport.clone(), Arc::new(tunnels));

        handler
            .handle(Action::Pong, InboundMessage::new(1, ConversationId(5), "/ping"))
            .await;
        assert!(transport.sent().is_empty());
    }
}
