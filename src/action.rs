//! SSH actions and the hold-and-delegate engine.
//!
//! An action is the outcome of policy evaluation: accept, reject, or
//! hold-and-delegate to a URL the coordination server decides behind. The
//! hold loop repeatedly fetches successor actions over the authenticated
//! control channel until a terminal accept or reject, under one overall
//! deadline with per-attempt exponential backoff.

use std::net::SocketAddr;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{ControlRequest, NodeAgent};

/// Overall deadline for one hold-and-delegate loop.
pub const DELEGATE_FETCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// First retry backoff after a failed fetch attempt.
const BACKOFF_INITIAL: Duration = Duration::from_secs(10);
/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(120);
/// At most this much of an error response body is logged.
const MAX_LOGGED_BODY: usize = 1 << 10;

/// A policy action. Exactly one of `accept`, `reject`, or a non-empty
/// `hold_and_delegate` should be set; an action with none of them is
/// malformed and treated as a terminal reject.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshAction {
    /// Banner text shown to the user when the action is applied.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub accept: bool,
    /// Maximum session lifetime; unset means unlimited.
    #[serde(default)]
    pub session_duration_secs: Option<u64>,
    #[serde(default)]
    pub allow_agent_forwarding: bool,
    #[serde(default)]
    pub allow_local_port_forwarding: bool,
    #[serde(default)]
    pub allow_remote_port_forwarding: bool,
    /// Session recorder addresses, dialed through the mesh.
    #[serde(default)]
    pub recorders: Vec<SocketAddr>,
    #[serde(default)]
    pub on_recording_failure: Option<RecorderFailurePolicy>,
    /// Delegate URL with `$SRC_NODE_IP`-style placeholders.
    #[serde(default)]
    pub hold_and_delegate: String,
}

impl SshAction {
    pub fn accept() -> Self {
        Self {
            accept: true,
            ..Default::default()
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            reject: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn hold(url: impl Into<String>) -> Self {
        Self {
            hold_and_delegate: url.into(),
            ..Default::default()
        }
    }

    pub fn session_duration(&self) -> Option<Duration> {
        self.session_duration_secs.map(Duration::from_secs)
    }
}

/// What to do when session recording cannot start or fails mid-stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderFailurePolicy {
    /// Control-plane URL notified of recording events; empty disables.
    #[serde(default)]
    pub notify_url: String,
    /// Refuse the session with this message when recording cannot start.
    #[serde(default)]
    pub reject_session_with_message: String,
    /// Terminate the session with this message when the recording stream
    /// fails mid-session.
    #[serde(default)]
    pub terminate_session_with_message: String,
}

/// Values substituted into a delegate URL.
#[derive(Debug, Clone)]
pub struct DelegateContext<'a> {
    pub src_ip: std::net::IpAddr,
    pub src_node_id: i64,
    pub dst_ip: std::net::IpAddr,
    pub dst_node_id: i64,
    pub ssh_user: &'a str,
    pub local_user: &'a str,
}

/// Expand the `$SRC_NODE_IP`, `$SRC_NODE_ID`, `$DST_NODE_IP`,
/// `$DST_NODE_ID`, `$SSH_USER` and `$LOCAL_USER` placeholders, URL-escaping
/// each value.
pub fn expand_delegate_url(url: &str, ctx: &DelegateContext<'_>) -> String {
    let escape = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();
    url.replace("$SRC_NODE_IP", &escape(&ctx.src_ip.to_string()))
        .replace("$SRC_NODE_ID", &ctx.src_node_id.to_string())
        .replace("$DST_NODE_IP", &escape(&ctx.dst_ip.to_string()))
        .replace("$DST_NODE_ID", &ctx.dst_node_id.to_string())
        .replace("$SSH_USER", &escape(ctx.ssh_user))
        .replace("$LOCAL_USER", &escape(ctx.local_user))
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("delegate fetch deadline elapsed")]
    DeadlineElapsed,
    #[error("delegate fetch canceled")]
    Canceled,
}

/// Fetch the next action from `url` through the control channel.
///
/// Transport errors, non-200 responses, and undecodable bodies are retried
/// with exponential backoff until [`DELEGATE_FETCH_TIMEOUT`] elapses or
/// `cancel` fires. The URL must already be expanded.
pub async fn fetch_ssh_action(
    agent: &dyn NodeAgent,
    cancel: &CancellationToken,
    url: &str,
) -> anyhow::Result<SshAction> {
    let deadline = tokio::time::Instant::now() + DELEGATE_FETCH_TIMEOUT;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Canceled.into());
        }

        let attempt = agent.do_control_request(ControlRequest::get(url));
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Canceled.into()),
            r = tokio::time::timeout_at(deadline, attempt) => {
                r.map_err(|_| FetchError::DeadlineElapsed)?
            }
        };

        match result {
            Ok(resp) if resp.status == 200 => match serde_json::from_slice(&resp.body) {
                Ok(action) => {
                    debug!(url, "fetched next SSH action");
                    return Ok(action);
                }
                Err(e) => warn!(url, error = %e, "invalid SSH action JSON"),
            },
            Ok(resp) => {
                let body = &resp.body[..resp.body.len().min(MAX_LOGGED_BODY)];
                warn!(
                    url,
                    status = resp.status,
                    body = %String::from_utf8_lossy(body),
                    "unexpected delegate fetch status"
                );
            }
            Err(e) => warn!(url, error = %e, "delegate fetch transport error"),
        }

        // Back off, staying under the overall deadline and cancel-aware.
        tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Canceled.into()),
            r = tokio::time::timeout_at(deadline, tokio::time::sleep(backoff)) => {
                if r.is_err() {
                    return Err(FetchError::DeadlineElapsed.into());
                }
            }
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}
