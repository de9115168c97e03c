//! Session recording in the asciinema cast format.
//!
//! A recording is a newline-delimited JSON stream: one [`CastHeader`] line
//! followed by `[elapsed_seconds, "o", text]` frame lines. The writer is
//! either a remote recorder dialed through the mesh's user-traffic dialer
//! or a local timestamped file under the agent's var root.
//!
//! The tee sits in front of the SSH channel on the output path. Whether a
//! recorder write failure kills the session or silently stops recording is
//! decided by the action's `on_recording_failure` policy: `fail_open` is
//! true unless `terminate_session_with_message` is set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::{ControlRequest, NodeAgent, NodePublicKey};

pub type RecorderWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// First line of a cast recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CastHeader {
    /// Cast format version; always 2.
    pub version: u32,
    /// Terminal size at session start; zero for non-PTY sessions.
    pub width: u32,
    pub height: u32,
    /// Unix timestamp of the session start.
    pub timestamp: i64,
    /// The command line, empty for interactive shells.
    pub command: String,
    /// Relevant environment (currently just TERM).
    pub env: HashMap<String, String>,
    pub ssh_user: String,
    pub local_user: String,
    pub src_node: String,
    pub src_node_id: String,
    pub connection_id: String,
    /// Login of the user behind the source node; absent for tagged nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_node_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_node_user_id: Option<i64>,
    /// ACL tags of the source node; present only for tagged nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_node_tags: Option<Vec<String>>,
}

/// Event types reported to the control plane for recording failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SshEventType {
    RecordingFailed,
    RecordingRejected,
    RecordingTerminated,
}

/// One attempt to reach a recorder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingAttempt {
    /// Address of the recorder that was tried.
    pub recorder: String,
    /// Why the attempt failed; empty for the attempt that succeeded.
    #[serde(default)]
    pub failure_message: String,
}

/// Notification POSTed through the control channel when a recording event
/// occurs. The server expects `201 Created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEventNotifyRequest {
    pub event_type: SshEventType,
    pub connection_id: String,
    pub cap_version: u32,
    pub node_key: NodePublicKey,
    pub src_node: i64,
    pub ssh_user: String,
    pub local_user: String,
    pub recording_attempts: Vec<RecordingAttempt>,
}

/// A recorder write failed and the policy is fail-closed.
#[derive(Debug, Error)]
#[error("recording write failed: {0}")]
pub struct RecordingWriteError(pub String);

/// State of one session recording.
pub struct Recording {
    start: tokio::time::Instant,
    /// Continue the session without recording after a write failure.
    fail_open: bool,
    /// Set once the tee gave up after a fail-open write failure.
    failed_open: AtomicBool,
    // Guards writes to and close of the writer. Once closed it is never
    // reopened.
    out: Mutex<Option<RecorderWriter>>,
}

impl Recording {
    pub fn new(out: RecorderWriter, fail_open: bool) -> Self {
        Self {
            start: tokio::time::Instant::now(),
            fail_open,
            failed_open: AtomicBool::new(false),
            out: Mutex::new(Some(out)),
        }
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn has_failed_open(&self) -> bool {
        self.failed_open.load(Ordering::Relaxed)
    }

    /// Write the header line. Must happen before any frame.
    pub async fn write_header(&self, header: &CastHeader) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(header)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        let w = out.as_mut().context("recording writer closed")?;
        w.write_all(&line).await.context("writing cast header")?;
        Ok(())
    }

    /// Record one chunk of session output.
    ///
    /// Returns `Ok(None)` when the frame was recorded (or recording has
    /// already failed open and the bytes pass through unrecorded),
    /// `Ok(Some(reason))` exactly once when a write failure flips the tee
    /// into failed-open mode, and `Err` when the failure is fail-closed and
    /// must kill the session before more bytes reach the client.
    pub async fn record_output(&self, data: &[u8]) -> Result<Option<String>, RecordingWriteError> {
        if self.failed_open.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let frame = serde_json::json!([
            self.start.elapsed().as_secs_f64(),
            "o",
            String::from_utf8_lossy(data),
        ]);
        let mut line = frame.to_string().into_bytes();
        line.push(b'\n');

        let result = {
            let mut out = self.out.lock().await;
            match out.as_mut() {
                Some(w) => w.write_all(&line).await.map_err(|e| e.to_string()),
                None => Err("recording writer closed".to_string()),
            }
        };
        match result {
            Ok(()) => Ok(None),
            Err(reason) if self.fail_open => {
                self.failed_open.store(true, Ordering::Relaxed);
                warn!(error = %reason, "recording write failed, continuing unrecorded");
                Ok(Some(reason))
            }
            Err(reason) => Err(RecordingWriteError(reason)),
        }
    }

    /// Flush and close the writer. Idempotent; ending the SSH session does
    /// not truncate an in-flight upload because the writer is shut down
    /// rather than dropped.
    pub async fn close(&self) {
        let mut out = self.out.lock().await;
        if let Some(mut w) = out.take() {
            if let Err(e) = w.shutdown().await {
                warn!(error = %e, "closing recording writer");
            }
        }
    }
}

/// Failure to reach any configured recorder.
#[derive(Debug, Error)]
#[error("no recorder reachable: {source}")]
pub struct RecorderConnectError {
    pub attempts: Vec<RecordingAttempt>,
    #[source]
    pub source: anyhow::Error,
}

/// Dial the recorders in order through the mesh's user-traffic dialer,
/// returning the first connection that succeeds together with the attempt
/// log.
pub async fn connect_to_recorder(
    agent: &dyn NodeAgent,
    recorders: &[SocketAddr],
) -> Result<(RecorderWriter, Vec<RecordingAttempt>), RecorderConnectError> {
    let mut attempts = Vec::with_capacity(recorders.len());
    let mut last_err: Option<anyhow::Error> = None;
    for addr in recorders {
        match agent.user_dial(*addr).await {
            Ok(conn) => {
                attempts.push(RecordingAttempt {
                    recorder: addr.to_string(),
                    failure_message: String::new(),
                });
                debug!(recorder = %addr, "connected to session recorder");
                return Ok((Box::new(conn), attempts));
            }
            Err(e) => {
                attempts.push(RecordingAttempt {
                    recorder: addr.to_string(),
                    failure_message: e.to_string(),
                });
                warn!(recorder = %addr, error = %e, "recorder dial failed");
                last_err = Some(e.into());
            }
        }
    }
    Err(RecorderConnectError {
        attempts,
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("no recorders configured")),
    })
}

/// Open a local cast file under `{var_root}/ssh-sessions/`.
pub async fn open_local_cast_file(
    var_root: &Path,
    now: DateTime<Utc>,
) -> anyhow::Result<(RecorderWriter, PathBuf)> {
    let dir = var_root.join("ssh-sessions");
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    let path = dir.join(format!(
        "ssh-session-{}-{:08x}.cast",
        nanos,
        rand::random::<u32>()
    ));
    let file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    debug!(path = %path.display(), "recording session to local disk");
    Ok((Box::new(file), path))
}

/// POST a recording event notification through the control channel.
pub async fn notify_control(agent: &dyn NodeAgent, url: &str, req: &SshEventNotifyRequest) {
    let body = match serde_json::to_vec(req) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "encoding event notify request");
            return;
        }
    };
    match agent.do_control_request(ControlRequest::post(url, body)).await {
        Ok(resp) if resp.status == 201 => {
            debug!(url, event = ?req.event_type, "recording event delivered");
        }
        Ok(resp) => warn!(url, status = resp.status, "event notify returned unexpected status"),
        Err(e) => warn!(url, error = %e, "event notify failed"),
    }
}
