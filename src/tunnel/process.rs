//! Tunnel process spawning and supervision.
//!
//! Both runners set `kill_on_drop(true)` and always `finish` the session,
//! whether the child exited, was killed, or never started.

use super::session::TunnelSession;
use crate::error::TunnelError;
use std::fmt::Write;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Max captured output per stream (64 KB).
const MAX_OUTPUT: usize = 64 * 1024;

/// How a supervised tunnel process ended.
#[derive(Debug)]
pub enum TunnelOutcome {
    /// The process exited by itself.
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    /// The session was cancelled and the process was killed (or never started).
    Cancelled,
}

fn spawn(program: &str, args: &[String], capture: bool) -> Result<Child, TunnelError> {
    let output = || {
        if capture {
            Stdio::piped()
        } else {
            Stdio::null()
        }
    };
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(output())
        .stderr(output())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TunnelError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// Run a tunnel process until it exits or `session` is cancelled,
/// capturing its output.
pub async fn run_to_completion(
    program: &str,
    args: &[String],
    session: &TunnelSession,
) -> Result<TunnelOutcome, TunnelError> {
    let result = supervise_captured(program, args, session).await;
    session.finish();
    result
}

async fn supervise_captured(
    program: &str,
    args: &[String],
    session: &TunnelSession,
) -> Result<TunnelOutcome, TunnelError> {
    if session.is_cancelled() {
        debug!("Session {} cancelled before launch", session.id());
        return Ok(TunnelOutcome::Cancelled);
    }

    let mut child = spawn(program, args, true)?;
    info!(
        "Started {} tunnel {} (pid {:?})",
        session.kind(),
        session.id(),
        child.id()
    );

    // Read pipes on their own tasks so `child` stays free for wait/kill
    let stdout = tokio::spawn(read_capped(child.stdout.take(), MAX_OUTPUT));
    let stderr = tokio::spawn(read_capped(child.stderr.take(), MAX_OUTPUT));

    let waited = tokio::select! {
        biased;
        _ = session.cancel_token().cancelled() => None,
        status = child.wait() => Some(status),
    };

    match waited {
        None => {
            terminate(&mut child, session).await;
            stdout.abort();
            stderr.abort();
            Ok(TunnelOutcome::Cancelled)
        }
        Some(status) => {
            let status = status?;
            info!("Tunnel {} exited: {}", session.id(), status);
            Ok(TunnelOutcome::Exited {
                status,
                stdout: stdout.await.unwrap_or_default(),
                stderr: stderr.await.unwrap_or_default(),
            })
        }
    }
}

/// Start a tunnel process without capturing output.
///
/// Spawn failures are returned immediately; afterwards a watcher task kills
/// the child when `session` is cancelled and finishes the session when the
/// child is gone.
pub fn spawn_detached(
    program: &str,
    args: &[String],
    session: TunnelSession,
) -> Result<JoinHandle<()>, TunnelError> {
    let mut child = match spawn(program, args, false) {
        Ok(child) => child,
        Err(e) => {
            session.finish();
            return Err(e);
        }
    };
    info!(
        "Started {} tunnel {} (pid {:?})",
        session.kind(),
        session.id(),
        child.id()
    );

    Ok(tokio::spawn(async move {
        let waited = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => None,
            status = child.wait() => Some(status),
        };
        match waited {
            None => terminate(&mut child, &session).await,
            Some(Ok(status)) => info!("Tunnel {} exited: {}", session.id(), status),
            Some(Err(e)) => warn!("Failed to wait for tunnel {}: {}", session.id(), e),
        }
        session.finish();
    }))
}

/// Kill and reap a cancelled child.
async fn terminate(child: &mut Child, session: &TunnelSession) {
    info!("Terminating {} tunnel {}", session.kind(), session.id());
    // kill() also waits for the child to exit
    if let Err(e) = child.kill().await {
        warn!("Failed to kill tunnel {}: {}", session.id(), e);
    }
}

/// Read from an optional pipe, keeping the first `max_bytes`.
///
/// Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, max_bytes: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(max_bytes.min(8192));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(s, "\n[truncated: {total_read} bytes total]");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::session::TunnelKind;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_output_on_exit() {
        let session = TunnelSession::new(TunnelKind::Reverse);
        let outcome = run_to_completion("sh", &args(&["-c", "echo connected"]), &session)
            .await
            .unwrap();

        match outcome {
            TunnelOutcome::Exited { status, stdout, .. } => {
                assert!(status.success());
                assert_eq!(stdout.trim(), "connected");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(session.is_finished());
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_exit_status_and_stderr() {
        let session = TunnelSession::new(TunnelKind::Reverse);
        let outcome = run_to_completion("sh", &args(&["-c", "echo denied >&2; exit 3"]), &session)
            .await
            .unwrap();

        match outcome {
            TunnelOutcome::Exited { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "denied");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let session = TunnelSession::new(TunnelKind::Reverse);
        let runner = session.clone();
        let handle = tokio::spawn(async move {
            run_to_completion("sleep", &args(&["30"]), &runner).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner should return promptly")
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, TunnelOutcome::Cancelled));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_session_never_launches() {
        let session = TunnelSession::new(TunnelKind::Reverse);
        session.cancel();
        let outcome = run_to_completion("/nonexistent/tunnel", &[], &session)
            .await
            .unwrap();
        assert!(matches!(outcome, TunnelOutcome::Cancelled));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let session = TunnelSession::new(TunnelKind::Reverse);
        let result = run_to_completion("/nonexistent/tunnel", &[], &session).await;
        assert!(matches!(result, Err(TunnelError::Spawn { .. })));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_detached_process_is_killed_on_cancel() {
        let session = TunnelSession::new(TunnelKind::Forwarding);
        let watcher = spawn_detached("sleep", &args(&["30"]), session.clone()).unwrap();

        assert!(!session.is_finished());
        session.cancel();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should exit")
            .unwrap();
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_detached_spawn_failure_finishes_session() {
        let session = TunnelSession::new(TunnelKind::Forwarding);
        let result = spawn_detached("/nonexistent/agent", &[], session.clone());
        assert!(matches!(result, Err(TunnelError::Spawn { .. })));
        assert!(session.is_finished());
    }
}
