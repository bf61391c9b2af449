//! Error types for the application.

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidValue { field: String, value: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Errors raised by the messaging transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("update offset {0} exceeds the Telegram range")]
    OffsetOutOfRange(u32),

    /// Raised by transports without an API client behind them, such as
    /// in-memory doubles.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while launching a tunnel or reading its status.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status endpoint request failed: {0}")]
    StatusRequest(#[from] reqwest::Error),

    #[error("status endpoint returned invalid JSON: {0}")]
    StatusJson(#[from] serde_json::Error),

    #[error("status endpoint lists no tunnels")]
    NoTunnels,

    #[error("malformed public url: {0}")]
    MalformedUrl(String),
}
