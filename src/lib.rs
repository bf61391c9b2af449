//! Tunnelgram library.
//!
//! A Telegram bot that opens and closes remote-access tunnels (reverse SSH
//! via a relay, or an ngrok TCP tunnel) on command from allow-listed chats.

pub mod app;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod rules;
pub mod transport;
pub mod tunnel;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Cursor, Dispatcher};
pub use handler::{CommandHandler, Handler};
pub use rules::{Action, AllowList, RuleTable};
pub use transport::{ConversationId, InboundMessage, Transport};
pub use tunnel::{TunnelManager, TunnelSession};
