//! Configuration management.
//!
//! Configuration is read from `~/.tunnelgram/config.json` (or an explicit
//! path), falling back to environment variables. A `.env` file in
//! `~/.tunnelgram/` or the working directory is loaded before the
//! environment is read.

use crate::error::ConfigError;
use crate::transport::ConversationId;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs_config_dir().join("config.json")
}

/// Get the .tunnelgram config directory path.
fn dirs_config_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".tunnelgram"))
        .unwrap_or_else(|| PathBuf::from(".tunnelgram"))
}

// ============================================================================
// File format
// ============================================================================

/// JSON configuration file structure.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    bot_token: String,
    #[serde(default)]
    allowed_chats: Vec<ChatIdValue>,
    #[serde(default)]
    poll: PollConfig,
    #[serde(default)]
    reverse_tunnel: ReverseTunnelConfig,
    #[serde(default)]
    forward_tunnel: ForwardTunnelConfig,
}

/// Chat ID that can be either string or integer in JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ChatIdValue {
    String(String),
    Integer(i64),
}

impl ChatIdValue {
    fn to_conversation_id(&self) -> Result<ConversationId, ConfigError> {
        match self {
            ChatIdValue::String(s) => parse_chat_id(s),
            ChatIdValue::Integer(i) => Ok(ConversationId(*i)),
        }
    }
}

fn parse_chat_id(value: &str) -> Result<ConversationId, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .map(ConversationId)
        .map_err(|_| ConfigError::InvalidValue {
            field: "allowed_chats".to_string(),
            value: value.to_string(),
        })
}

/// Parse a comma-separated list of chat ids, e.g. `"123,-100456"`.
///
/// Empty segments are skipped; anything else that is not an integer is an
/// error.
pub fn parse_allowed_chats(value: &str) -> Result<Vec<ConversationId>, ConfigError> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_chat_id)
        .collect()
}

// ============================================================================
// Sections
// ============================================================================

/// Long-poll and dispatch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Long-poll timeout passed to the transport
    pub timeout_seconds: u32,
    /// Fixed delay before retrying a failed poll
    pub retry_delay_seconds: u64,
    /// Upper bound on concurrently running handlers; unbounded when unset
    pub max_concurrent_handlers: Option<usize>,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 3,
            retry_delay_seconds: 2,
            max_concurrent_handlers: None,
            shutdown_grace_seconds: 5,
        }
    }
}

impl PollConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Reverse SSH tunnel (`ssh -R alias:22:localhost:22 serveo.net`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReverseTunnelConfig {
    pub program: String,
    pub relay_host: String,
    /// Name the relay publishes this machine under
    pub alias: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// User shown in the connection instructions
    pub ssh_user: String,
    /// Replaces the generated `-R` arguments when non-empty
    pub args: Vec<String>,
    /// How long a new tunnel waits for the previous process to be reaped
    pub replace_grace_seconds: u64,
}

impl Default for ReverseTunnelConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            relay_host: "serveo.net".to_string(),
            alias: get_hostname(),
            remote_port: 22,
            local_port: 22,
            ssh_user: "usr".to_string(),
            args: Vec::new(),
            replace_grace_seconds: 5,
        }
    }
}

impl ReverseTunnelConfig {
    /// Arguments passed to `program`.
    pub fn command_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        vec![
            "-R".to_string(),
            format!(
                "{}:{}:localhost:{}",
                self.alias, self.remote_port, self.local_port
            ),
            self.relay_host.clone(),
        ]
    }

    pub fn replace_grace(&self) -> Duration {
        Duration::from_secs(self.replace_grace_seconds)
    }
}

/// Forwarding tunnel agent (`ngrok tcp 22`) and its local status endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardTunnelConfig {
    pub program: String,
    pub args: Vec<String>,
    pub status_url: String,
    /// Wait after launching the agent before the first status query
    pub settle_delay_seconds: u64,
    /// Number of status queries before giving up (at least one is made)
    pub status_attempts: u32,
    pub status_retry_delay_seconds: u64,
    pub ssh_user: String,
    /// Cancel the current session before installing the new one
    pub cancel_previous: bool,
    /// How long to wait for a cancelled forwarding agent to exit
    pub replace_grace_seconds: u64,
}

impl Default for ForwardTunnelConfig {
    fn default() -> Self {
        Self {
            program: "ngrok".to_string(),
            args: vec!["tcp".to_string(), "22".to_string()],
            status_url: "http://localhost:4040/api/tunnels/".to_string(),
            settle_delay_seconds: 3,
            status_attempts: 1,
            status_retry_delay_seconds: 1,
            ssh_user: "usr".to_string(),
            cancel_previous: false,
            replace_grace_seconds: 5,
        }
    }
}

impl ForwardTunnelConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_seconds)
    }

    pub fn status_retry_delay(&self) -> Duration {
        Duration::from_secs(self.status_retry_delay_seconds)
    }

    pub fn replace_grace(&self) -> Duration {
        Duration::from_secs(self.replace_grace_seconds)
    }
}

// ============================================================================
// Application Configuration
// ============================================================================

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token
    pub bot_token: String,
    /// Conversations allowed to issue commands
    pub allowed_chats: Vec<ConversationId>,
    pub poll: PollConfig,
    pub reverse_tunnel: ReverseTunnelConfig,
    pub forward_tunnel: ForwardTunnelConfig,
}

impl Config {
    /// Load configuration from JSON file, falling back to environment variables.
    ///
    /// Search order:
    /// 1. Provided config_path (if any)
    /// 2. `~/.tunnelgram/config.json`
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            if path.exists() {
                return Self::from_json(&path);
            }
            tracing::warn!("Config file {} not found, trying defaults", path.display());
        }

        let default_path = default_config_path();
        if default_path.exists() {
            return Self::from_json(&default_path);
        }

        Self::from_env()
    }

    /// Load configuration from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&content)?;

        let allowed_chats = file
            .allowed_chats
            .iter()
            .map(ChatIdValue::to_conversation_id)
            .collect::<Result<Vec<_>, _>>()?;

        Self {
            bot_token: file.bot_token,
            allowed_chats,
            poll: file.poll,
            reverse_tunnel: file.reverse_tunnel,
            forward_tunnel: file.forward_tunnel,
        }
        .validated()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env files are fine
        let _ = dotenvy::from_path(dirs_config_dir().join(".env"));
        let _ = dotenvy::dotenv();

        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build configuration from a variable lookup.
    ///
    /// Recognized variables: `TELEGRAM_BOT_TOKEN` (or `TOKEN`),
    /// `ALLOWED_CHATS` (or `GOOD_CHATS`) and `NGROK_PATH`.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELEGRAM_BOT_TOKEN")
            .or_else(|| lookup("TOKEN"))
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".to_string()))?;

        let chats = lookup("ALLOWED_CHATS")
            .or_else(|| lookup("GOOD_CHATS"))
            .ok_or_else(|| ConfigError::MissingEnvVar("ALLOWED_CHATS".to_string()))?;
        let allowed_chats = parse_allowed_chats(&chats)?;

        let mut forward_tunnel = ForwardTunnelConfig::default();
        if let Some(path) = lookup("NGROK_PATH").filter(|p| !p.is_empty()) {
            forward_tunnel.program = path;
        }

        Self {
            bot_token,
            allowed_chats,
            poll: PollConfig::default(),
            reverse_tunnel: ReverseTunnelConfig::default(),
            forward_tunnel,
        }
        .validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingField("bot_token".to_string()));
        }
        if self.allowed_chats.is_empty() {
            return Err(ConfigError::MissingField(
                "allowed_chats must list at least one chat".to_string(),
            ));
        }
        if self.forward_tunnel.status_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "forward_tunnel.status_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(self)
    }
}

/// Get system hostname.
fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
