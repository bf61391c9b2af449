//! Wires configuration, transport, rule table and tunnel manager together.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::handler::CommandHandler;
use crate::rules::{command_specs, AllowList, RuleTable};
use crate::transport::telegram::TelegramTransport;
use crate::transport::Transport;
use crate::tunnel::TunnelManager;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Publish the command menu to every allowed chat.
///
/// Failures are logged; returns the number of chats that accepted the menu.
pub async fn register_commands(transport: &dyn Transport, allow_list: &AllowList) -> usize {
    let commands = command_specs();
    let mut registered = 0;
    for conversation in allow_list.iter() {
        match transport.register_commands(conversation, &commands).await {
            Ok(()) => registered += 1,
            Err(e) => warn!("Error sending commands to {}: {}", conversation, e),
        }
    }
    registered
}

/// Run the bot until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(&config.bot_token));
    let allow_list = AllowList::new(config.allowed_chats.iter().copied());

    let registered = register_commands(transport.as_ref(), &allow_list).await;
    info!(
        "Registered commands for {}/{} chats",
        registered,
        allow_list.len()
    );

    let tunnels = Arc::new(
        TunnelManager::new(
            Arc::clone(&transport),
            config.reverse_tunnel.clone(),
            config.forward_tunnel.clone(),
        )
        .context("Failed to create tunnel manager")?,
    );
    let handler = Arc::new(CommandHandler::new(
        Arc::clone(&transport),
        Arc::clone(&tunnels),
    ));
    let mut dispatcher = Dispatcher::new(
        transport,
        RuleTable::standard(allow_list),
        handler,
        config.poll.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    dispatcher.run(shutdown).await;
    tunnels.shutdown().await;
    Ok(())
}
