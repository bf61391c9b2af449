//! Client for the forwarding agent's local status endpoint.
//!
//! The agent publishes `{"tunnels": [{"public_url": "tcp://host:port"}, ...]}`;
//! only the first tunnel is used.

use crate::error::TunnelError;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TunnelsResponse {
    #[serde(default)]
    tunnels: Vec<PublishedTunnel>,
}

#[derive(Debug, Deserialize)]
struct PublishedTunnel {
    public_url: String,
}

/// Host and port the agent exposes to the internet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicAddress {
    pub host: String,
    pub port: u16,
}

/// Extract the first tunnel's address from a status response body.
pub fn parse_status(body: &str) -> Result<PublicAddress, TunnelError> {
    let response: TunnelsResponse = serde_json::from_str(body)?;
    let first = response.tunnels.first().ok_or(TunnelError::NoTunnels)?;
    parse_public_url(&first.public_url)
}

/// Split `proto://host:port` into host and port.
pub fn parse_public_url(public_url: &str) -> Result<PublicAddress, TunnelError> {
    let malformed = || TunnelError::MalformedUrl(public_url.to_string());

    let url = Url::parse(public_url).map_err(|_| malformed())?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(malformed)?;
    let port = url.port_or_known_default().ok_or_else(malformed)?;

    Ok(PublicAddress {
        host: host.to_string(),
        port,
    })
}

/// HTTP client bound to one status URL.
#[derive(Debug, Clone)]
pub struct StatusClient {
    client: Client,
    url: String,
}

impl StatusClient {
    pub fn new(url: &str) -> Result<Self, TunnelError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Query the endpoint once.
    pub async fn public_address(&self) -> Result<PublicAddress, TunnelError> {
        debug!("Querying tunnel status at {}", self.url);
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_status(&body)
    }
}
