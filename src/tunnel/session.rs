//! A single tunnel session: the cancellation handle of one tunnel process.

use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which tunnel program a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Reverse,
    Forwarding,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Reverse => write!(f, "reverse"),
            TunnelKind::Forwarding => write!(f, "forwarding"),
        }
    }
}

/// Handle to a tunnel process.
///
/// Cloning shares the underlying signals. `cancel` asks the process runner
/// to terminate the child; the runner calls `finish` once the child has been
/// reaped (or was never started).
#[derive(Debug, Clone)]
pub struct TunnelSession {
    id: String,
    kind: TunnelKind,
    cancel: CancellationToken,
    exited: CancellationToken,
}

impl TunnelSession {
    pub fn new(kind: TunnelKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            kind,
            cancel: CancellationToken::new(),
            exited: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// Request termination. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the session ended: no process is running for it anymore.
    pub(crate) fn finish(&self) {
        self.cancel.cancel();
        self.exited.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Wait until the session's process is gone. Returns `false` on timeout.
    pub async fn wait_finished(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.exited.cancelled())
            .await
            .is_ok()
    }
}
