//! Tunnelgram - CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tunnelgram::cli::{Cli, Commands};
use tunnelgram::config::{default_config_path, Config};
use tunnelgram::rules::{command_specs, AllowList};
use tunnelgram::transport::telegram::TelegramTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Run => {
            let config = Config::load(cli.config).context("Failed to load configuration")?;
            tunnelgram::app::run(config)
                .await
                .context("Failed to run Telegram bot")?;
        }
        Commands::Register => {
            let config = Config::load(cli.config).context("Failed to load configuration")?;
            let transport = TelegramTransport::new(&config.bot_token);
            let allow_list = AllowList::new(config.allowed_chats.iter().copied());
            let registered = tunnelgram::app::register_commands(&transport, &allow_list).await;
            println!(
                "Registered {} commands for {}/{} chats",
                command_specs().len(),
                registered,
                allow_list.len()
            );
        }
        Commands::Status => {
            print_status(cli.config);
        }
    }

    Ok(())
}

/// Print configuration status.
fn print_status(config_path: Option<std::path::PathBuf>) {
    println!("📊 Tunnelgram Status\n");

    match Config::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration: Found");
            println!("   Token: {}", redact(&config.bot_token));
            let chats: Vec<String> = config.allowed_chats.iter().map(|c| c.to_string()).collect();
            println!("   Allowed chats: {}", chats.join(", "));
            println!(
                "   Poll: {}s timeout, {}s retry",
                config.poll.timeout_seconds, config.poll.retry_delay_seconds
            );
            println!();
            println!("🔁 Reverse tunnel:");
            println!(
                "   {} {}",
                config.reverse_tunnel.program,
                config.reverse_tunnel.command_args().join(" ")
            );
            println!();
            println!("🌐 Forwarding tunnel:");
            println!(
                "   {} {}",
                config.forward_tunnel.program,
                config.forward_tunnel.args.join(" ")
            );
            println!("   Status URL: {}", config.forward_tunnel.status_url);
            println!(
                "   Settle delay: {}s",
                config.forward_tunnel.settle_delay_seconds
            );
        }
        Err(e) => {
            println!("❌ Configuration: Not found or invalid");
            println!("   Error: {}", e);
            println!();
            println!("Create config at {}:", default_config_path().display());
            println!(r#"  {{"bot_token": "...", "allowed_chats": [123456789]}}"#);
        }
    }
}

fn redact(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{}…", visible)
}
