use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::{FromWorker, ToWorker};

/// Subcommand the controller passes when respawning its own executable as
/// the worker process.
pub const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(std::io::Error),

    #[error("worker stdio unavailable: {0}")]
    Stdio(&'static str),

    #[error("relay i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("relay protocol error: {0}")]
    Protocol(String),
}

/// Worker-side end of the queue pair.
pub struct RelayConn {
    pub commands: mpsc::UnboundedReceiver<ToWorker>,
    pub events: mpsc::UnboundedSender<FromWorker>,
}

/// Handle on a spawned worker process, for the kill escalation only; the
/// softer severities travel the queue as envelopes.
#[derive(Clone)]
pub struct ProcessControl {
    child: Arc<tokio::sync::Mutex<Child>>,
}

impl ProcessControl {
    /// Immediate, non-negotiable termination (SIGKILL). The controller
    /// reconciles the worker's resources afterwards.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "kill failed; worker already gone");
        }
    }

    /// Reap the worker. Returns whether it exited cleanly.
    pub async fn wait(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.wait().await {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(error = %e, "failed to wait for worker process");
                false
            }
        }
    }
}

/// Controller-side end of the queue pair.
pub struct RelayHandle {
    pub commands: mpsc::UnboundedSender<ToWorker>,
    pub events: mpsc::UnboundedReceiver<FromWorker>,
    /// Present for the process transport only.
    pub control: Option<ProcessControl>,
}

impl RelayHandle {
    pub fn send(&self, msg: ToWorker) {
        if self.commands.send(msg).is_err() {
            warn!("worker command channel closed — message dropped");
        }
    }
}

/// In-process transport: the queue pair handed directly to a worker task.
/// Used by tests and embedders; the semantics match the process transport.
pub fn channel_pair() -> (RelayHandle, RelayConn) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    (
        RelayHandle {
            commands: cmd_tx,
            events: evt_rx,
            control: None,
        },
        RelayConn {
            commands: cmd_rx,
            events: evt_tx,
        },
    )
}

/// Process transport: spawn this executable's `worker` subcommand and bridge
/// the queue pair over its stdio as JSON lines. The worker's stdout carries
/// nothing but the event stream; its logs go to the inherited stderr.
pub fn spawn_worker_process() -> Result<RelayHandle, RelayError> {
    let exe = std::env::current_exe().map_err(RelayError::Spawn)?;
    let mut child = Command::new(exe)
        .arg(WORKER_SUBCOMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(RelayError::Spawn)?;

    let stdin = child.stdin.take().ok_or(RelayError::Stdio("stdin"))?;
    let stdout = child.stdout.take().ok_or(RelayError::Stdio("stdout"))?;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ToWorker>();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<FromWorker>();

    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(msg) = cmd_rx.recv().await {
            let mut line = match serde_json::to_string(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode command");
                    continue;
                }
            };
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() {
                debug!("worker stdin closed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<FromWorker>(&line) {
                        Ok(msg) => {
                            if evt_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, line, "undecodable worker message"),
                    }
                }
                Ok(None) => {
                    // EOF: worker exited (possibly killed). Dropping the
                    // sender closes the outbound queue, which the pump
                    // treats as an unclean end of stream.
                    debug!("worker stdout closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "worker stdout read failed");
                    break;
                }
            }
        }
    });

    Ok(RelayHandle {
        commands: cmd_tx,
        events: evt_rx,
        control: Some(ProcessControl {
            child: Arc::new(tokio::sync::Mutex::new(child)),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_pair_carries_both_directions() {
        let (handle, mut conn) = channel_pair();

        handle.send(ToWorker::Interrupt);
        assert!(matches!(conn.commands.recv().await, Some(ToWorker::Interrupt)));

        conn.events.send(FromWorker::Eos).unwrap();
        let mut events = handle.events;
        assert!(matches!(events.recv().await, Some(FromWorker::Eos)));
    }

    #[tokio::test]
    async fn send_after_worker_gone_is_not_fatal() {
        let (handle, conn) = channel_pair();
        drop(conn);
        // Logged and dropped, no panic.
        handle.send(ToWorker::Eos);
    }
}
