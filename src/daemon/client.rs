//! RPC client: reach the workspace daemon, or report that the caller should
//! fall back to in-process mode.
//!
//! A connect failure against an existing socket means the daemon died
//! uncleanly; the stale socket and PID file are removed so the next client
//! can respawn. Auto-start is gated on `BEADS_AUTO_START_DAEMON`.

use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{BeadsError, Result};
use crate::workspace::Layout;

use super::protocol::{self, ERR_UNKNOWN_OP, Request, Response};

/// Environment flag: spawn a daemon on demand when none is running.
pub const ENV_AUTO_START: &str = "BEADS_AUTO_START_DAEMON";

/// Outcome of one RPC call.
#[derive(Debug)]
pub enum CallOutcome {
    /// The daemon answered.
    Ok(serde_json::Value),
    /// The daemon does not implement this operation; run it in-process.
    UnknownOp,
}

/// A connected client.
pub struct DaemonClient {
    stream: UnixStream,
    next_id: u64,
}

impl DaemonClient {
    /// Try to reach the workspace daemon. `Ok(None)` means no daemon (and
    /// none could be started): use in-process mode.
    ///
    /// # Errors
    /// I/O errors other than the expected connect failures.
    pub fn connect(layout: &Layout) -> Result<Option<Self>> {
        if let Some(client) = Self::try_connect(layout)? {
            return Ok(Some(client));
        }
        if !auto_start_enabled() {
            return Ok(None);
        }
        spawn_daemon(layout)?;
        // Give the daemon a moment to bind.
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(50));
            if let Some(client) = Self::try_connect(layout)? {
                return Ok(Some(client));
            }
        }
        Ok(None)
    }

    fn try_connect(layout: &Layout) -> Result<Option<Self>> {
        let socket_path = layout.socket_path();
        if !socket_path.exists() {
            return Ok(None);
        }
        match UnixStream::connect(&socket_path) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(60)))?;
                stream.set_write_timeout(Some(Duration::from_secs(60)))?;
                Ok(Some(Self { stream, next_id: 0 }))
            }
            Err(e) => {
                tracing::debug!(error = %e, "stale daemon socket; cleaning up");
                let _ = std::fs::remove_file(&socket_path);
                let _ = std::fs::remove_file(layout.pid_path());
                Ok(None)
            }
        }
    }

    /// Issue one request.
    ///
    /// # Errors
    /// `Timeout` when the daemon misses its deadline; the daemon's
    /// structured error otherwise.
    pub fn call(&mut self, op: &str, args: serde_json::Value) -> Result<CallOutcome> {
        self.next_id += 1;
        let request = Request {
            id: self.next_id,
            op: op.to_owned(),
            args,
        };
        protocol::write_frame(&mut self.stream, &request)?;
        let response: Response = protocol::read_frame(&mut self.stream)?.ok_or_else(|| {
            BeadsError::DaemonUnavailable {
                detail: "daemon closed the connection mid-request".to_owned(),
            }
        })?;
        if response.id != request.id {
            return Err(BeadsError::DaemonUnavailable {
                detail: format!(
                    "response id {} does not match request id {}",
                    response.id, request.id
                ),
            });
        }
        match (response.result, response.error) {
            (Some(result), _) => Ok(CallOutcome::Ok(result)),
            (None, Some(error)) if error.code == ERR_UNKNOWN_OP => Ok(CallOutcome::UnknownOp),
            (None, Some(error)) if error.code == protocol::ERR_TIMEOUT => {
                Err(BeadsError::Timeout {
                    operation: op.to_owned(),
                })
            }
            (None, Some(error)) => Err(BeadsError::DaemonUnavailable {
                detail: format!("{}: {}", error.code, error.message),
            }),
            (None, None) => Err(BeadsError::DaemonUnavailable {
                detail: "daemon sent an empty response".to_owned(),
            }),
        }
    }

    /// Ask the daemon to stop. Ignores the connection dropping mid-reply.
    pub fn shutdown(mut self) {
        let _ = self.call("shutdown", serde_json::Value::Null);
    }
}

fn auto_start_enabled() -> bool {
    std::env::var(ENV_AUTO_START)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn spawn_daemon(layout: &Layout) -> Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .args(["daemon", "run"])
        .env(crate::workspace::ENV_DIR, layout.control_dir())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
