//! Tunnel lifecycle manager.
//!
//! Owns the current [`TunnelSession`] and implements the start/stop protocol:
//! starting a reverse tunnel cancels the current session and waits for its
//! process to be reaped before launching the new one. The forwarding tunnel
//! installs its session without cancelling the previous one unless
//! `cancel_previous` is configured.

mod process;
mod session;
mod status;

pub use process::{run_to_completion, spawn_detached, TunnelOutcome};
pub use session::{TunnelKind, TunnelSession};
pub use status::{parse_public_url, parse_status, PublicAddress, StatusClient};

use crate::config::{ForwardTunnelConfig, ReverseTunnelConfig};
use crate::error::TunnelError;
use crate::transport::{escape_code, ConversationId, Formatting, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Telegram rejects messages longer than 4096 characters.
const MAX_REPLY_CHARS: usize = 4000;

/// Manages at most one current tunnel session.
pub struct TunnelManager {
    transport: Arc<dyn Transport>,
    reverse: ReverseTunnelConfig,
    forward: ForwardTunnelConfig,
    status: StatusClient,
    current: Mutex<Option<TunnelSession>>,
}

impl TunnelManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        reverse: ReverseTunnelConfig,
        forward: ForwardTunnelConfig,
    ) -> Result<Self, TunnelError> {
        let status = StatusClient::new(&forward.status_url)?;
        Ok(Self {
            transport,
            reverse,
            forward,
            status,
            current: Mutex::new(None),
        })
    }

    /// Snapshot of the current session, if any.
    pub async fn current_session(&self) -> Option<TunnelSession> {
        self.current.lock().await.clone()
    }

    /// Install a new current session.
    ///
    /// Returns the new session and, when `cancel_previous` is set, the
    /// cancelled previous one so the caller can wait for it to exit.
    async fn replace_session(
        &self,
        kind: TunnelKind,
        cancel_previous: bool,
    ) -> (TunnelSession, Option<TunnelSession>) {
        let session = TunnelSession::new(kind);
        let mut current = self.current.lock().await;
        let previous = current.replace(session.clone());
        drop(current);

        let previous = match previous {
            Some(previous) if cancel_previous => {
                previous.cancel();
                Some(previous)
            }
            Some(previous) => {
                if !previous.is_finished() {
                    warn!(
                        "{} tunnel {} left running without a handle",
                        previous.kind(),
                        previous.id()
                    );
                }
                None
            }
            None => None,
        };
        (session, previous)
    }

    /// How long to wait for a cancelled session of `kind` to exit.
    fn grace_for(&self, kind: TunnelKind) -> Duration {
        match kind {
            TunnelKind::Reverse => self.reverse.replace_grace(),
            TunnelKind::Forwarding => self.forward.replace_grace(),
        }
    }

    async fn await_previous(&self, previous: Option<TunnelSession>) {
        if let Some(previous) = previous {
            let grace = self.grace_for(previous.kind());
            if !previous.wait_finished(grace).await {
                warn!(
                    "{} tunnel {} did not exit within {:?}",
                    previous.kind(),
                    previous.id(),
                    grace
                );
            }
        }
    }

    /// Start the reverse SSH tunnel, replacing the current session.
    ///
    /// Replies immediately with connection instructions; the returned task
    /// replies again when the process ends.
    pub async fn start_reverse_tunnel(&self, conversation: ConversationId) -> JoinHandle<()> {
        self.transport
            .reply(conversation, "trying to open tunnel...", Formatting::Plain)
            .await;

        let (session, previous) = self.replace_session(TunnelKind::Reverse, true).await;
        self.await_previous(previous).await;

        let transport = Arc::clone(&self.transport);
        let program = self.reverse.program.clone();
        let args = self.reverse.command_args();
        info!("Opening reverse tunnel {} for {}", session.id(), conversation);
        let handle = tokio::spawn(async move {
            let outcome = run_to_completion(&program, &args, &session).await;
            let text = describe_outcome(&outcome);
            transport
                .reply(conversation, &text, Formatting::Plain)
                .await;
        });

        self.transport
            .reply(
                conversation,
                &reverse_instructions(&self.reverse),
                Formatting::MarkdownV2,
            )
            .await;
        handle
    }

    /// Start the forwarding agent and report its public address.
    ///
    /// Blocks the calling task for the settle delay, then queries the status
    /// endpoint. Every failure is replied as text.
    pub async fn start_forwarding_tunnel(&self, conversation: ConversationId) {
        self.transport
            .reply(conversation, "opening ngrok...", Formatting::Plain)
            .await;

        let (session, previous) = self
            .replace_session(TunnelKind::Forwarding, self.forward.cancel_previous)
            .await;
        self.await_previous(previous).await;

        info!(
            "Opening forwarding tunnel {} for {}",
            session.id(),
            conversation
        );
        if let Err(e) = spawn_detached(&self.forward.program, &self.forward.args, session) {
            warn!("Forwarding tunnel failed to start: {}", e);
            self.transport
                .reply(conversation, &e.to_string(), Formatting::Plain)
                .await;
            return;
        }

        tokio::time::sleep(self.forward.settle_delay()).await;

        match self.query_status().await {
            Ok(address) => {
                self.transport
                    .reply(
                        conversation,
                        &forward_instructions(&self.forward.ssh_user, &address),
                        Formatting::MarkdownV2,
                    )
                    .await;
            }
            Err(e) => {
                warn!("Tunnel status unavailable: {}", e);
                self.transport
                    .reply(conversation, &e.to_string(), Formatting::Plain)
                    .await;
            }
        }
    }

    async fn query_status(&self) -> Result<PublicAddress, TunnelError> {
        let mut attempt = 1;
        loop {
            match self.status.public_address().await {
                Ok(address) => return Ok(address),
                Err(e) if attempt < self.forward.status_attempts => {
                    warn!(
                        "Status query {}/{} failed: {}",
                        attempt, self.forward.status_attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.forward.status_retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel the current session.
    pub async fn stop(&self, conversation: ConversationId) {
        let already_stopped = {
            let current = self.current.lock().await;
            let already_stopped = current.as_ref().map_or(true, TunnelSession::is_cancelled);
            if let Some(session) = current.as_ref() {
                info!("Stopping {} tunnel {}", session.kind(), session.id());
                session.cancel();
            }
            already_stopped
        };

        if already_stopped {
            self.transport
                .reply(conversation, "already stopped", Formatting::Plain)
                .await;
        }
        self.transport
            .reply(conversation, "stopping...", Formatting::Plain)
            .await;
    }

    /// Cancel the current session and wait for its process to exit.
    pub async fn shutdown(&self) {
        let current = self.current.lock().await.take();
        if let Some(session) = current {
            session.cancel();
            self.await_previous(Some(session)).await;
        }
    }
}

fn reverse_instructions(config: &ReverseTunnelConfig) -> String {
    format!(
        "use\n\n`ssh -J {} {}@{}`\n\nto connect",
        escape_code(&config.relay_host),
        escape_code(&config.ssh_user),
        escape_code(&config.alias)
    )
}

fn forward_instructions(ssh_user: &str, address: &PublicAddress) -> String {
    format!(
        "use\n\n`ssh {}@{} -p {}`\n\nto connect",
        escape_code(ssh_user),
        escape_code(&address.host),
        address.port
    )
}

/// Reply text for a finished reverse tunnel.
fn describe_outcome(outcome: &Result<TunnelOutcome, TunnelError>) -> String {
    let text = match outcome {
        Ok(TunnelOutcome::Cancelled) => "tunnel cancelled".to_string(),
        Ok(TunnelOutcome::Exited {
            status,
            stdout,
            stderr,
        }) => {
            let output = [stdout.trim(), stderr.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            match (status.success(), output.is_empty()) {
                (true, true) => "tunnel closed".to_string(),
                (true, false) => output,
                (false, true) => format!("err {}", status),
                (false, false) => format!("err {}\n{}", status, output),
            }
        }
        Err(e) => format!("err {}", e),
    };
    truncate(text)
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_REPLY_CHARS {
        return text;
    }
    let mut truncated: String = text.chars().take(MAX_REPLY_CHARS).collect();
    truncated.push_str("...");
    truncated
}
