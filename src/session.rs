//! Per-session supervision: process launch, I/O plumbing, cancellation.
//!
//! One [`SshSession`] owns one accepted SSH session channel. Its `run`
//! task attaches to the connection (refusing during shutdown), starts the
//! optional duration timer and recording pipeline, launches the child
//! process (kernel PTY or pipes), wires the copy tasks, and reaps the
//! child. A cancellation watcher kills the child at most once, guarded by
//! an atomic compare-and-swap, and writes the cancellation cause's
//! user-visible message to the session before the kill.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::ConnShared;
use crate::recording::{
    connect_to_recorder, notify_control, open_local_cast_file, CastHeader, Recording,
    RecordingAttempt, SshEventNotifyRequest, SshEventType,
};
use crate::agent::CAPABILITY_VERSION;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Why a session was canceled. The first cause wins; later cancellations
/// of the same scope keep the original cause.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationCause {
    /// Normal completion; cancels the scope so helper tasks wind down.
    SessionDone,
    /// The action's session duration elapsed.
    TimedOut(Duration),
    /// A policy change revoked access.
    AccessRevoked,
    /// The recording stream failed under a fail-closed policy.
    RecorderTerminated(String),
    /// The server is shutting down.
    ServerShutdown,
    /// An I/O error broke the session.
    Error(String),
}

impl TerminationCause {
    /// Message written to the session's stderr before the child is killed,
    /// if the cause is user-visible.
    pub fn user_visible_message(&self) -> Option<String> {
        match self {
            TerminationCause::TimedOut(d) => {
                Some(format!("Session timeout of {}s elapsed.", d.as_secs()))
            }
            TerminationCause::AccessRevoked => Some("Access revoked.".to_string()),
            TerminationCause::RecorderTerminated(msg) if !msg.is_empty() => Some(msg.clone()),
            _ => None,
        }
    }
}

/// A session's cancellation scope: a token plus the first cause.
#[derive(Clone)]
pub struct SessionScope {
    token: CancellationToken,
    cause: Arc<StdMutex<Option<TerminationCause>>>,
}

impl SessionScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(StdMutex::new(None)),
        }
    }

    /// Cancel the scope. The first cause is kept; later calls only cancel.
    pub fn cancel(&self, cause: TerminationCause) {
        {
            let mut slot = self.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause.lock().unwrap().clone()
    }
}

impl Default for SessionScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Local account metadata for the mapped user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserMeta {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

/// Look up a local OS account by name.
pub fn lookup_local_user(name: &str) -> anyhow::Result<UserMeta> {
    let user = nix::unistd::User::from_name(name)
        .with_context(|| format!("looking up local user {name:?}"))?
        .with_context(|| format!("no such local user {name:?}"))?;
    Ok(UserMeta {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
        shell: user.shell,
    })
}

/// Resolve the supplementary group IDs of a local account.
pub fn user_group_ids(user: &UserMeta) -> anyhow::Result<Vec<u32>> {
    let cname = std::ffi::CString::new(user.name.as_str())
        .context("local user name contains NUL")?;
    let groups = nix::unistd::getgrouplist(&cname, nix::unistd::Gid::from_raw(user.gid))
        .with_context(|| format!("resolving group IDs for {:?}", user.name))?;
    Ok(groups.into_iter().map(|g| g.as_raw()).collect())
}

/// Input routed from the connection handler into a session.
#[derive(Debug)]
pub(crate) enum SessionInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Eof,
}

/// The client's pty-req parameters.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone)]
pub(crate) enum SessionKind {
    Shell,
    Exec(String),
    Sftp,
}

/// Where session stdin goes: the PTY master or the child's stdin pipe.
enum StdinSink {
    Pty(pty_process::OwnedWritePty),
    Pipe(tokio::process::ChildStdin),
}

impl StdinSink {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            StdinSink::Pty(w) => w.write_all(data).await,
            StdinSink::Pipe(w) => w.write_all(data).await,
        }
    }

    fn resize(&self, cols: u32, rows: u32) {
        if let StdinSink::Pty(w) = self {
            if let Err(e) = w.resize(pty_process::Size::new(rows as u16, cols as u16)) {
                warn!(error = %e, "pty resize failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            StdinSink::Pty(w) => w.shutdown().await,
            StdinSink::Pipe(w) => w.shutdown().await,
        };
    }
}

/// A launched child process and its I/O endpoints.
struct Launched {
    child: tokio::process::Child,
    pid: i32,
    stdin: StdinSink,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// None for PTY sessions: the PTY merges stderr into the stream.
    stderr: Option<tokio::process::ChildStderr>,
    /// Held open until the child is reaped; dropping it closes the slave
    /// side so the master read unblocks.
    pts: Option<pty_process::Pts>,
}

/// Forwards agent connections from a local Unix socket to the client.
struct AgentForwarder {
    dir: PathBuf,
    sock_path: PathBuf,
    task: JoinHandle<()>,
}

impl Drop for AgentForwarder {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// One accepted SSH session.
pub(crate) struct SshSession {
    shared_id: String,
    conn: Arc<ConnShared>,
    scope: SessionScope,
    channel_id: ChannelId,
    handle: Handle,
    kind: SessionKind,
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    agent_forward_requested: bool,
    input: Option<mpsc::UnboundedReceiver<SessionInput>>,
}

impl SshSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: Arc<ConnShared>,
        channel_id: ChannelId,
        handle: Handle,
        kind: SessionKind,
        pty: Option<PtyRequest>,
        env: Vec<(String, String)>,
        agent_forward_requested: bool,
        input: mpsc::UnboundedReceiver<SessionInput>,
    ) -> Self {
        let shared_id = crate::conn::new_id("sess", conn.srv().agent.now());
        debug!(conn_id = %conn.conn_id, session = %shared_id, "starting session");
        Self {
            shared_id,
            conn,
            scope: SessionScope::new(),
            channel_id,
            handle,
            kind,
            pty,
            env,
            agent_forward_requested,
            input: Some(input),
        }
    }

    /// Entrypoint for a newly accepted session; runs to completion.
    pub(crate) async fn run(mut self) {
        let metrics = self.conn.srv().metrics.clone();
        metrics.active_sessions.inc();

        // Messages queued during the auth dance (welcome banners) are the
        // first bytes the client sees on the session.
        for msg in self.conn.banner.drain_pending() {
            self.print(&format!("{msg}\r\n")).await;
        }

        if !self.conn.attach_session(&self.shared_id, self.scope.clone()) {
            self.print("meshssh is shutting down\r\n").await;
            self.exit(1).await;
            metrics.active_sessions.dec();
            return;
        }

        self.serve().await;

        self.conn.detach_session(&self.shared_id);
        self.scope.cancel(TerminationCause::SessionDone);
        metrics.active_sessions.dec();
    }

    async fn serve(&mut self) {
        let conn = self.conn.clone();
        let Some(final_action) = conn.final_action() else {
            // Cannot happen for an accepted channel; be defensive anyway.
            self.exit(1).await;
            return;
        };
        let Some(lu) = conn.local_user() else {
            self.exit(1).await;
            return;
        };

        info!(
            conn_id = %conn.conn_id,
            session = %self.shared_id,
            peer = %conn.info_display(),
            local_user = %lu.name,
            "access granted"
        );

        // Duration timer: one shot that cancels the scope with a timed-out
        // cause.
        let timer = final_action.session_duration().map(|d| {
            let scope = self.scope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                scope.cancel(TerminationCause::TimedOut(d));
            })
        });

        let euid = nix::unistd::geteuid();
        if !euid.is_root() && lu.uid != euid.as_raw() {
            warn!(
                session = %self.shared_id,
                user = %lu.name,
                euid = euid.as_raw(),
                "cannot switch user from non-root process"
            );
            self.print("can't switch user\r\n").await;
            self.exit(1).await;
            if let Some(t) = timer {
                t.abort();
            }
            return;
        }

        let is_sftp = matches!(self.kind, SessionKind::Sftp);

        let mut agent_forwarder = None;
        let mut recording: Option<Arc<Recording>> = None;
        let mut rec_attempts: Vec<RecordingAttempt> = Vec::new();
        if !is_sftp {
            match self.setup_agent_forwarding(&lu).await {
                Ok(fwd) => agent_forwarder = fwd,
                Err(e) => warn!(session = %self.shared_id, error = %e, "agent forwarding failed"),
            }

            if self.should_record() {
                match self.start_recording(&lu).await {
                    Ok(Some((rec, attempts))) => {
                        recording = Some(rec);
                        rec_attempts = attempts;
                    }
                    Ok(None) => {}
                    Err(message) => {
                        self.print(&format!("{message}\r\n")).await;
                        self.exit(1).await;
                        if let Some(t) = timer {
                            t.abort();
                        }
                        return;
                    }
                }
            }
        }

        let agent_sock = agent_forwarder
            .as_ref()
            .map(|f: &AgentForwarder| f.sock_path.clone());
        let mut launched = match self.launch_process(&lu, agent_sock.as_deref()) {
            Ok(l) => l,
            Err(e) => {
                warn!(session = %self.shared_id, error = %e, "start failed");
                if let Some(msg) = self.scope.cause().and_then(|c| c.user_visible_message()) {
                    self.print(&format!("{msg}\r\n")).await;
                }
                self.exit(1).await;
                if let Some(t) = timer {
                    t.abort();
                }
                return;
            }
        };

        // One-shot kill guard shared between the watcher and the natural
        // exit path.
        let exit_once = Arc::new(AtomicBool::new(false));
        let process_done = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_kill_watcher(launched.pid, exit_once.clone());

        // stdin: SSH channel -> child, through the recording tee with
        // direction "i", which passes bytes through unrecorded.
        let stdin_scope = self.scope.clone();
        let mut input = self.input.take().expect("session input taken once");
        let mut sink = launched.stdin;
        let stdin_task = tokio::spawn(async move {
            while let Some(msg) = input.recv().await {
                match msg {
                    SessionInput::Data(data) => {
                        if let Err(e) = sink.write_all(&data).await {
                            debug!(error = %e, "stdin copy ended");
                            stdin_scope.cancel(TerminationCause::Error(e.to_string()));
                            break;
                        }
                    }
                    SessionInput::Resize { cols, rows } => sink.resize(cols, rows),
                    SessionInput::Eof => break,
                }
            }
            sink.shutdown().await;
        });

        // Output copy tasks. When every output stream has drained, the
        // channel gets exactly one EOF (the CloseWrite of this transport).
        let mut outputs: JoinSet<()> = JoinSet::new();
        self.spawn_stdout_copy(
            &mut outputs,
            launched.stdout,
            recording.clone(),
            rec_attempts,
            process_done.clone(),
        );
        if let Some(stderr) = launched.stderr.take() {
            self.spawn_stderr_copy(&mut outputs, stderr);
        }

        let status = launched.child.wait().await;
        process_done.store(true, Ordering::SeqCst);

        // Either this makes the kill watcher a no-op, or the watcher
        // already fired and this is the no-op.
        let _ = exit_once.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);

        // Close the child side of the PTY so the master read unblocks.
        drop(launched.pts.take());

        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let drain = async move {
            while outputs.join_next().await.is_some() {}
            let _ = handle.eof(channel_id).await;
        };
        tokio::select! {
            _ = drain => {}
            _ = self.scope.cancelled() => {}
        }

        let code = match status {
            Ok(st) => match st.code() {
                Some(code) => {
                    debug!(session = %self.shared_id, code, "child exited");
                    code.max(0) as u32
                }
                // Killed by signal (supervisor cancellation or external).
                None => 1,
            },
            Err(e) => {
                warn!(session = %self.shared_id, error = %e, "wait failed");
                1
            }
        };
        self.exit(code).await;

        if let Some(t) = timer {
            t.abort();
        }
        watcher.abort();
        stdin_task.abort();
        if let Some(rec) = recording {
            rec.close().await;
        }
        drop(agent_forwarder);
        info!(session = %self.shared_id, code, "session complete");
    }

    fn spawn_stdout_copy(
        &self,
        outputs: &mut JoinSet<()>,
        mut stdout: Box<dyn AsyncRead + Send + Unpin>,
        recording: Option<Arc<Recording>>,
        attempts: Vec<RecordingAttempt>,
        process_done: Arc<AtomicBool>,
    ) {
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let scope = self.scope.clone();
        let conn = self.conn.clone();
        let shared_id = self.shared_id.clone();
        let on_failure = conn.recording_failure_policy();
        outputs.spawn(async move {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            let mut flip_reported = false;
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(rec) = &recording {
                            match rec.record_output(&buf[..n]).await {
                                Ok(None) => {}
                                Ok(Some(reason)) => {
                                    // Failed open: keep serving, notify once.
                                    if !flip_reported {
                                        flip_reported = true;
                                        notify_recording_event(
                                            &conn,
                                            &on_failure,
                                            SshEventType::RecordingFailed,
                                            attempts.clone(),
                                            &reason,
                                        );
                                    }
                                }
                                Err(e) => {
                                    // Fail closed: the session dies before
                                    // any more bytes reach the client.
                                    let message = on_failure
                                        .as_ref()
                                        .map(|p| p.terminate_session_with_message.clone())
                                        .unwrap_or_default();
                                    warn!(
                                        session = %shared_id,
                                        error = %e,
                                        "recording failed, closing session"
                                    );
                                    notify_recording_event(
                                        &conn,
                                        &on_failure,
                                        SshEventType::RecordingTerminated,
                                        attempts.clone(),
                                        &e.to_string(),
                                    );
                                    scope.cancel(TerminationCause::RecorderTerminated(message));
                                    break;
                                }
                            }
                        }
                        if handle
                            .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // A read error from the PTY master after the child
                        // exited is the expected EIO, not a failure.
                        let because_exit = process_done.load(Ordering::SeqCst)
                            && e.raw_os_error() == Some(nix::libc::EIO);
                        if !because_exit {
                            warn!(session = %shared_id, error = %e, "stdout copy failed");
                            scope.cancel(TerminationCause::Error(e.to_string()));
                        }
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stderr_copy(
        &self,
        outputs: &mut JoinSet<()>,
        mut stderr: tokio::process::ChildStderr,
    ) {
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let shared_id = self.shared_id.clone();
        outputs.spawn(async move {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if handle
                            .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(session = %shared_id, error = %e, "stderr copy ended");
                        break;
                    }
                }
            }
        });
    }

    /// Waits for the scope and kills the child at most once, writing the
    /// cause's user-visible message first.
    fn spawn_kill_watcher(&self, pid: i32, exit_once: Arc<AtomicBool>) -> JoinHandle<()> {
        let scope = self.scope.clone();
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let shared_id = self.shared_id.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            if exit_once
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            let cause = scope.cause();
            if let Some(msg) = cause.as_ref().and_then(|c| c.user_visible_message()) {
                let _ = handle
                    .extended_data(
                        channel_id,
                        1,
                        CryptoVec::from_slice(format!("\r\n\r\n{msg}\r\n\r\n").as_bytes()),
                    )
                    .await;
            }
            info!(session = %shared_id, ?cause, pid, "terminating session");
            // The supervisor reaps the child regardless of why it died.
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        })
    }

    /// Create the agent-forwarding socket and start forwarding agent
    /// connections to the client. No-op (without error) when forwarding is
    /// disabled or the action does not allow it.
    async fn setup_agent_forwarding(
        &self,
        lu: &UserMeta,
    ) -> anyhow::Result<Option<AgentForwarder>> {
        let allowed = self
            .conn
            .final_action()
            .map(|a| a.allow_agent_forwarding)
            .unwrap_or(false);
        if !self.agent_forward_requested || !allowed || self.conn.srv().flags.disable_forwarding {
            return Ok(None);
        }
        debug!(session = %self.shared_id, "agent forwarding requested");

        let dir = std::env::temp_dir().join(format!("meshssh-agent-{:08x}", rand::random::<u32>()));
        std::fs::create_dir(&dir).context("creating agent socket dir")?;
        let sock_path = dir.join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path)
            .context("binding agent forwarding socket")?;

        // The socket is reachable only by the target user; the directory
        // must stay traversable.
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        let uid = Some(nix::unistd::Uid::from_raw(lu.uid));
        let gid = Some(nix::unistd::Gid::from_raw(lu.gid));
        nix::unistd::chown(&sock_path, uid, gid).context("chown agent socket")?;
        nix::unistd::chown(&dir, uid, gid).context("chown agent socket dir")?;

        let handle = self.handle.clone();
        let shared_id = self.shared_id.clone();
        let task = tokio::spawn(async move {
            loop {
                let (mut unix_conn, _) = match listener.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(session = %shared_id, error = %e, "agent listener closed");
                        return;
                    }
                };
                let handle = handle.clone();
                let shared_id = shared_id.clone();
                tokio::spawn(async move {
                    match handle.channel_open_agent().await {
                        Ok(channel) => {
                            let mut stream = channel.into_stream();
                            let _ = tokio::io::copy_bidirectional(&mut unix_conn, &mut stream)
                                .await;
                        }
                        Err(e) => {
                            warn!(session = %shared_id, error = ?e, "opening agent channel failed")
                        }
                    }
                });
            }
        });

        Ok(Some(AgentForwarder {
            dir,
            sock_path,
            task,
        }))
    }

    fn should_record(&self) -> bool {
        let (recorders, _) = self.conn.recorders_of_record();
        !recorders.is_empty() || self.conn.srv().flags.record_to_local_disk
    }

    /// Open the recording writer and emit the cast header.
    ///
    /// `Ok(None)` means recording failed open and the session continues
    /// unrecorded; `Err` carries the user-visible message of a fail-closed
    /// start failure.
    async fn start_recording(
        &self,
        lu: &UserMeta,
    ) -> Result<Option<(Arc<Recording>, Vec<RecordingAttempt>)>, String> {
        const GENERIC: &str = "can't start new recording";
        let conn = &self.conn;
        let agent = &conn.srv().agent;

        let node_key = agent.node_key();
        if node_key.is_zero() {
            warn!(session = %self.shared_id, "recording unavailable: no node key");
            return Err(GENERIC.to_string());
        }

        let (recorders, on_failure) = conn.recorders_of_record();
        let fail_open = on_failure
            .as_ref()
            .map(|p| p.terminate_session_with_message.is_empty())
            .unwrap_or(true);

        let (writer, attempts) = if recorders.is_empty() {
            if !conn.srv().flags.record_to_local_disk {
                warn!(session = %self.shared_id, "no recorders configured");
                return Err(GENERIC.to_string());
            }
            let Some(var_root) = agent.var_root() else {
                warn!(session = %self.shared_id, "no var root for recording storage");
                return Err(GENERIC.to_string());
            };
            match open_local_cast_file(&var_root, agent.now()).await {
                Ok((w, _path)) => (w, Vec::new()),
                Err(e) => {
                    warn!(session = %self.shared_id, error = %e, "opening local recording");
                    return Err(GENERIC.to_string());
                }
            }
        } else {
            match connect_to_recorder(agent.as_ref(), &recorders).await {
                Ok((w, attempts)) => (w, attempts),
                Err(err) => {
                    let reject_msg = on_failure
                        .as_ref()
                        .map(|p| p.reject_session_with_message.clone())
                        .unwrap_or_default();
                    let event = if reject_msg.is_empty() {
                        SshEventType::RecordingFailed
                    } else {
                        SshEventType::RecordingRejected
                    };
                    if !err.attempts.is_empty() {
                        notify_recording_event(
                            conn,
                            &on_failure,
                            event,
                            err.attempts.clone(),
                            "",
                        );
                    }
                    if !reject_msg.is_empty() {
                        warn!(
                            session = %self.shared_id,
                            error = %err,
                            "recording start failed, rejecting session"
                        );
                        return Err(reject_msg);
                    }
                    warn!(
                        session = %self.shared_id,
                        error = %err,
                        "recording start failed, failing open"
                    );
                    return Ok(None);
                }
            }
        };

        let rec = Recording::new(writer, fail_open);
        let header = self.cast_header(lu);
        if let Err(e) = rec.write_header(&header).await {
            warn!(session = %self.shared_id, error = %e, "writing cast header");
            return Err(GENERIC.to_string());
        }
        Ok(Some((Arc::new(rec), attempts)))
    }

    fn cast_header(&self, lu: &UserMeta) -> CastHeader {
        let conn = &self.conn;
        let info = conn.info().expect("info set before session start");
        let agent = &conn.srv().agent;
        let (width, height) = self
            .pty
            .as_ref()
            .map(|p| (p.cols, p.rows))
            .unwrap_or((0, 0));
        let term = self
            .env
            .iter()
            .find(|(k, _)| k == "TERM")
            .map(|(_, v)| v.clone())
            .or_else(|| self.pty.as_ref().map(|p| p.term.clone()))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "xterm-256color".to_string());
        let command = match &self.kind {
            SessionKind::Exec(cmd) => cmd.clone(),
            _ => String::new(),
        };
        let mut header = CastHeader {
            version: 2,
            width,
            height,
            timestamp: agent.now().timestamp(),
            command,
            env: std::collections::HashMap::from([("TERM".to_string(), term)]),
            ssh_user: info.ssh_user.clone(),
            local_user: lu.name.clone(),
            src_node: info.node.name.trim_end_matches('.').to_string(),
            src_node_id: info.node.stable_id.clone(),
            connection_id: conn.conn_id.clone(),
            src_node_user: None,
            src_node_user_id: None,
            src_node_tags: None,
        };
        if info.node.is_tagged() {
            header.src_node_tags = Some(info.node.tags.clone());
        } else {
            header.src_node_user = Some(info.uprof.login_name.clone());
            header.src_node_user_id = Some(info.node.user_id);
        }
        header
    }

    fn launch_process(
        &mut self,
        lu: &UserMeta,
        agent_sock: Option<&std::path::Path>,
    ) -> anyhow::Result<Launched> {
        if self.scope.is_cancelled() {
            anyhow::bail!("session canceled before launch");
        }
        let env = self.build_env(lu, agent_sock);

        if let (Some(pty), false) = (&self.pty, matches!(self.kind, SessionKind::Sftp)) {
            // Kernel PTY: the kernel device is authoritative, there is no
            // protocol-level echo emulation on top of it.
            let mut pty_dev = pty_process::Pty::new().context("allocating pty")?;
            let pts = pty_dev.pts().context("opening pts")?;
            if let Err(e) = pty_dev.resize(pty_process::Size::new(
                pty.rows as u16,
                pty.cols as u16,
            )) {
                warn!(error = %e, "initial pty resize failed");
            }
            let mut cmd = pty_process::Command::new(&lu.shell);
            if let SessionKind::Exec(command) = &self.kind {
                cmd.arg("-c");
                cmd.arg(command);
            }
            cmd.uid(lu.uid);
            cmd.gid(lu.gid);
            cmd.current_dir(&lu.home);
            cmd.env_clear();
            cmd.envs(env);
            let child = cmd.spawn(&pts).context("spawning pty child")?;
            let pid = child.id().map(|p| p as i32).unwrap_or(-1);
            let (read_half, write_half) = pty_dev.into_split();
            return Ok(Launched {
                child,
                pid,
                stdin: StdinSink::Pty(write_half),
                stdout: Box::new(read_half),
                stderr: None,
                pts: Some(pts),
            });
        }

        let program = match &self.kind {
            SessionKind::Sftp => self.conn.srv().flags.sftp_server_path.clone(),
            _ => lu.shell.clone(),
        };
        let mut cmd = tokio::process::Command::new(&program);
        if let SessionKind::Exec(command) = &self.kind {
            cmd.arg("-c").arg(command);
        }
        cmd.uid(lu.uid);
        cmd.gid(lu.gid);
        cmd.current_dir(&lu.home);
        cmd.env_clear();
        cmd.envs(env);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let stdin = child.stdin.take().context("child stdin missing")?;
        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take();
        Ok(Launched {
            child,
            pid,
            stdin: StdinSink::Pipe(stdin),
            stdout: Box::new(stdout),
            stderr,
            pts: None,
        })
    }

    /// Baseline environment plus the client vars that survived the
    /// accept-env filter.
    fn build_env(
        &self,
        lu: &UserMeta,
        agent_sock: Option<&std::path::Path>,
    ) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            ("HOME".into(), lu.home.display().to_string()),
            ("USER".into(), lu.name.clone()),
            ("LOGNAME".into(), lu.name.clone()),
            ("SHELL".into(), lu.shell.display().to_string()),
            (
                "PATH".into(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
            ),
        ];
        if let Some(pty) = &self.pty {
            let term = if pty.term.is_empty() {
                "xterm-256color".to_string()
            } else {
                pty.term.clone()
            };
            env.push(("TERM".into(), term));
        }
        env.extend(self.env.iter().cloned());
        if let Some(sock) = agent_sock {
            env.push(("SSH_AUTH_SOCK".into(), sock.display().to_string()));
        }
        env
    }

    async fn print(&self, msg: &str) {
        let _ = self
            .handle
            .data(self.channel_id, CryptoVec::from_slice(msg.as_bytes()))
            .await;
    }

    async fn exit(&self, code: u32) {
        let _ = self.handle.exit_status_request(self.channel_id, code).await;
        let _ = self.handle.close(self.channel_id).await;
    }
}

/// Fire-and-forget recording event notification through the control
/// channel. Runs on a background task so the session's lifetime does not
/// bound the upload.
fn notify_recording_event(
    conn: &Arc<ConnShared>,
    on_failure: &Option<crate::action::RecorderFailurePolicy>,
    event: SshEventType,
    mut attempts: Vec<RecordingAttempt>,
    failure_message: &str,
) {
    let Some(policy) = on_failure else { return };
    if policy.notify_url.is_empty() || attempts.is_empty() {
        return;
    }
    if !failure_message.is_empty() {
        if let Some(last) = attempts.last_mut() {
            last.failure_message = failure_message.to_string();
        }
    }
    let Some(info) = conn.info() else { return };
    let Some(lu) = conn.local_user() else { return };
    let req = SshEventNotifyRequest {
        event_type: event,
        connection_id: conn.conn_id.clone(),
        cap_version: CAPABILITY_VERSION,
        node_key: conn.srv().agent.node_key(),
        src_node: info.node.id,
        ssh_user: info.ssh_user.clone(),
        local_user: lu.name.clone(),
        recording_attempts: attempts,
    };
    let agent = conn.srv().agent.clone();
    let url = policy.notify_url.clone();
    tokio::spawn(async move {
        notify_control(agent.as_ref(), &url, &req).await;
    });
}
