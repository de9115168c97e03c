//! Per-connection state machine.
//!
//! Each accepted transport gets one [`ConnHandler`] (the russh callback
//! surface) plus one [`ConnShared`] holding the state that outlives the
//! callbacks: the resolved mesh identity, the initial and final actions,
//! the mapped local user, the banner channel, and the live session list.
//!
//! Authentication is by mesh identity. The none, password, and public-key
//! callbacks all run the same sequence — resolve ConnInfo, evaluate the
//! policy, drive the hold-and-delegate loop — and the credentials the
//! client presented are ignored; the extra methods exist only to appease
//! buggy clients.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{self, DelegateContext, RecorderFailurePolicy, SshAction};
use crate::agent::{is_mesh_ip, NodeView, UserProfile};
use crate::policy::{self, PolicyMatch, SshPolicy};
use crate::server::ServerInner;
use crate::session::{
    lookup_local_user, user_group_ids, PtyRequest, SessionInput, SessionKind, SessionScope,
    SshSession, TerminationCause, UserMeta,
};

/// Username suffix that forces the password-auth workaround for clients
/// confused by success on the "none" method.
pub const FORCE_PASSWORD_SUFFIX: &str = "+password";

const DEFAULT_DENIAL: &str = "meshssh: access denied";

/// Build a `<prefix>-<UTC compact>-<5-byte hex>` identifier.
pub(crate) fn new_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u64 = u64::from(rand::random::<u32>()) << 8 | u64::from(rand::random::<u8>());
    format!("{}-{}-{:010x}", prefix, now.format("%Y%m%dT%H%M%S"), suffix)
}

/// The mesh identity behind a connection. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnInfo {
    /// Requested SSH username, with any force-password suffix stripped.
    pub ssh_user: String,
    /// Mesh address and port the connection came from.
    pub src: SocketAddr,
    /// Mesh address and port the connection came to.
    pub dst: SocketAddr,
    /// The source address's node.
    pub node: NodeView,
    /// The node's user profile.
    pub uprof: UserProfile,
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}@{}", self.src, self.ssh_user, self.dst)
    }
}

/// Sentinel returned from an auth callback to terminate the transport
/// immediately, with no further auth methods offered.
#[derive(Debug, Error)]
#[error("meshssh: terminal auth failure")]
pub struct TerminalAuth;

/// Banner send after authentication resolved.
#[derive(Debug, Error)]
#[error("banner channel closed after auth")]
pub struct BannerClosed;

#[derive(Default)]
struct BannerState {
    closed: bool,
    pending: Vec<String>,
    history: Vec<String>,
}

/// The pre-auth message stream.
///
/// Messages can only be sent before authentication resolves; the channel
/// closes when the final action is reached and refuses later sends.
/// Pending messages are flushed as the first bytes of the first session
/// channel (the transport library has no dynamic pre-auth banner frame).
pub struct BannerChannel {
    inner: StdMutex<BannerState>,
}

impl BannerChannel {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(BannerState::default()),
        }
    }

    pub fn send(&self, msg: &str) -> Result<(), BannerClosed> {
        let mut st = self.inner.lock().unwrap();
        if st.closed {
            return Err(BannerClosed);
        }
        st.pending.push(msg.to_string());
        st.history.push(msg.to_string());
        Ok(())
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub(crate) fn drain_pending(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().unwrap().pending)
    }

    /// Everything ever sent, including already-flushed messages.
    pub fn history(&self) -> Vec<String> {
        self.inner.lock().unwrap().history.clone()
    }
}

impl Default for BannerChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state shared between the callback handler, the transport
/// driver, and the server shell.
pub struct ConnShared {
    pub conn_id: String,
    srv: Arc<ServerInner>,
    src: SocketAddr,
    dst: SocketAddr,
    info: OnceLock<ConnInfo>,
    action0: OnceLock<SshAction>,
    final_action: OnceLock<SshAction>,
    local_user: OnceLock<UserMeta>,
    user_group_ids: OnceLock<Vec<u32>>,
    accept_env: OnceLock<Vec<String>>,
    pub(crate) banner: BannerChannel,
    /// Cancels the transport driver, closing the raw connection.
    pub(crate) transport: CancellationToken,
    // The server state lock is always acquired before this one; the
    // reverse order is forbidden.
    sessions: StdMutex<Vec<(String, SessionScope)>>,
}

impl ConnShared {
    pub(crate) fn new(
        conn_id: String,
        srv: Arc<ServerInner>,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Self {
        Self {
            conn_id,
            srv,
            src,
            dst,
            info: OnceLock::new(),
            action0: OnceLock::new(),
            final_action: OnceLock::new(),
            local_user: OnceLock::new(),
            user_group_ids: OnceLock::new(),
            accept_env: OnceLock::new(),
            banner: BannerChannel::new(),
            transport: CancellationToken::new(),
            sessions: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn srv(&self) -> &Arc<ServerInner> {
        &self.srv
    }

    pub fn info(&self) -> Option<&ConnInfo> {
        self.info.get()
    }

    pub(crate) fn info_display(&self) -> String {
        self.info
            .get()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "<unauthenticated>".to_string())
    }

    pub fn final_action(&self) -> Option<SshAction> {
        self.final_action.get().cloned()
    }

    pub(crate) fn local_user(&self) -> Option<UserMeta> {
        self.local_user.get().cloned()
    }

    /// Group IDs of the mapped local user, resolved during auth.
    pub fn group_ids(&self) -> Vec<u32> {
        self.user_group_ids.get().cloned().unwrap_or_default()
    }

    pub(crate) fn accept_env(&self) -> Vec<String> {
        self.accept_env.get().cloned().unwrap_or_default()
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Register a session, refusing once the server entered shutdown.
    pub(crate) fn attach_session(&self, id: &str, scope: SessionScope) -> bool {
        // Server lock first, then the connection's session list.
        let st = self.srv.state_lock();
        if st.shutdown {
            return false;
        }
        self.sessions.lock().unwrap().push((id.to_string(), scope));
        true
    }

    pub(crate) fn detach_session(&self, id: &str) {
        self.sessions.lock().unwrap().retain(|(sid, _)| sid != id);
    }

    pub(crate) fn cancel_all_sessions(&self, cause: TerminationCause) {
        let sessions = self.sessions.lock().unwrap();
        for (_, scope) in sessions.iter() {
            scope.cancel(cause.clone());
        }
    }

    /// The policy in effect: the mesh map's, or the debug policy file when
    /// the map has none (or is ignored).
    pub(crate) fn ssh_policy(&self) -> Option<SshPolicy> {
        let agent = &self.srv.agent;
        if !agent.should_serve_ssh() {
            return None;
        }
        let map = agent.mesh_map()?;
        if !self.srv.flags.ignore_mesh_policy {
            if let Some(pol) = map.ssh_policy {
                return Some(pol);
            }
        }
        let path = self.srv.flags.policy_file.as_ref()?;
        debug!(conn_id = %self.conn_id, path = %path.display(), "reading debug SSH policy file");
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reading debug SSH policy file");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(pol) => Some(pol),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid JSON in debug SSH policy file");
                None
            }
        }
    }

    pub(crate) fn evaluate_policy(&self) -> anyhow::Result<PolicyMatch> {
        let pol = self
            .ssh_policy()
            .context("rejecting connection; no SSH policy")?;
        let info = self.info.get().context("connection info not set")?;
        policy::evaluate(&pol, info, self.srv.agent.now())
            .context("rejecting connection; no matching policy")
    }

    /// Whether the connection still holds under the current policy: the
    /// new action must be Accept or HoldAndDelegate and map to the same
    /// local user.
    pub(crate) fn is_still_valid(&self) -> bool {
        let m = match self.evaluate_policy() {
            Ok(m) => m,
            Err(e) => {
                debug!(conn_id = %self.conn_id, error = %e, "revalidation failed");
                return false;
            }
        };
        if !m.action.accept && m.action.hold_and_delegate.is_empty() {
            return false;
        }
        match self.local_user.get() {
            Some(lu) => lu.name == m.local_user,
            None => false,
        }
    }

    /// Re-run policy evaluation after a policy change; cancel every
    /// session if the connection no longer holds.
    pub(crate) fn check_still_valid(&self) {
        if self.is_still_valid() {
            return;
        }
        self.srv.metrics.policy_change_kick.inc();
        info!(conn_id = %self.conn_id, "connection no longer valid per new SSH policy; closing");
        self.cancel_all_sessions(TerminationCause::AccessRevoked);
    }

    /// Recorder list and failure policy in effect: the final action's if
    /// it names recorders, otherwise the initial action's.
    pub(crate) fn recorders_of_record(
        &self,
    ) -> (Vec<SocketAddr>, Option<RecorderFailurePolicy>) {
        if let Some(fa) = self.final_action.get() {
            if !fa.recorders.is_empty() {
                return (fa.recorders.clone(), fa.on_recording_failure.clone());
            }
        }
        match self.action0.get() {
            Some(a0) => (a0.recorders.clone(), a0.on_recording_failure.clone()),
            None => (Vec::new(), None),
        }
    }

    pub(crate) fn recording_failure_policy(&self) -> Option<RecorderFailurePolicy> {
        self.recorders_of_record().1
    }
}

/// Per-channel state accumulated before the session task starts.
struct ChannelCtx {
    input_tx: mpsc::UnboundedSender<SessionInput>,
    input_rx: Option<mpsc::UnboundedReceiver<SessionInput>>,
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    agent_requested: bool,
    started: bool,
}

impl ChannelCtx {
    fn new() -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            input_tx,
            input_rx: Some(input_rx),
            pty: None,
            env: Vec::new(),
            agent_requested: false,
            started: false,
        }
    }
}

/// The russh callback surface for one connection.
pub struct ConnHandler {
    shared: Arc<ConnShared>,
    channels: DashMap<ChannelId, ChannelCtx>,
}

impl ConnHandler {
    pub(crate) fn new(shared: Arc<ConnShared>) -> Self {
        Self {
            shared,
            channels: DashMap::new(),
        }
    }

    /// Resolve and pin the connection's mesh identity. Idempotent;
    /// executes at most once per connection.
    fn set_info(&self, raw_user: &str) -> anyhow::Result<()> {
        if self.shared.info.get().is_some() {
            return Ok(());
        }
        let shared = &self.shared;
        let ssh_user = raw_user
            .strip_suffix(FORCE_PASSWORD_SUFFIX)
            .unwrap_or(raw_user)
            .to_string();
        if !shared.srv.skip_mesh_addr_check() {
            if !is_mesh_ip(shared.dst.ip()) {
                anyhow::bail!("rejecting non-mesh local address {}", shared.dst);
            }
            if !is_mesh_ip(shared.src.ip()) {
                anyhow::bail!("rejecting non-mesh remote address {}", shared.src);
            }
        }
        let (node, uprof) = shared
            .srv
            .agent
            .whois("tcp", shared.src)
            .with_context(|| format!("unknown mesh identity from src {}", shared.src))?;
        let ci = ConnInfo {
            ssh_user,
            src: shared.src,
            dst: shared.dst,
            node,
            uprof,
        };
        info!(conn_id = %shared.conn_id, conn = %ci, "handling conn");
        let _ = shared.info.set(ci);
        Ok(())
    }

    /// Queue a user-visible pre-auth message, logging if the banner
    /// channel already closed.
    fn queue_banner(&self, message: &str) {
        if let Err(e) = self.shared.banner.send(message) {
            warn!(conn_id = %self.shared.conn_id, error = %e, "failed to queue auth banner");
        }
    }

    /// Deny with a user-visible message and terminate the transport.
    fn deny(&self, message: &str) -> anyhow::Error {
        let message = if message.is_empty() {
            DEFAULT_DENIAL
        } else {
            message
        };
        self.queue_banner(message);
        self.shared.banner.close();
        info!(conn_id = %self.shared.conn_id, denial = %message, "access denied");
        TerminalAuth.into()
    }

    /// Deny with a diagnostic banner; the underlying error goes to the
    /// log, never to the client.
    fn deny_banner(&self, message: &str, err: Option<anyhow::Error>) -> anyhow::Error {
        if let Some(err) = err {
            warn!(conn_id = %self.shared.conn_id, error = %format!("{err:#}"), "{message}");
        } else {
            warn!(conn_id = %self.shared.conn_id, "{message}");
        }
        self.deny(&format!("meshssh: {message}"))
    }

    fn expand_url(&self, url: &str) -> String {
        let info = self.shared.info.get().expect("info set before hold loop");
        let dst_node_id = self
            .shared
            .srv
            .agent
            .mesh_map()
            .map(|m| m.self_node_id)
            .unwrap_or(0);
        let local_user = self
            .shared
            .local_user
            .get()
            .map(|u| u.name.clone())
            .unwrap_or_default();
        action::expand_delegate_url(
            url,
            &DelegateContext {
                src_ip: info.src.ip(),
                src_node_id: info.node.id,
                dst_ip: info.dst.ip(),
                dst_node_id,
                ssh_user: &info.ssh_user,
                local_user: &local_user,
            },
        )
    }

    /// The authentication sequence, identical for every auth method: set
    /// ConnInfo, evaluate the policy, drive the hold loop to a terminal
    /// action.
    async fn client_auth(&mut self, raw_user: &str) -> Result<Auth, anyhow::Error> {
        let shared = self.shared.clone();
        let metrics = &shared.srv.metrics;

        // Already resolved: the trivial password step after a partial
        // success, or a client retrying a method post-accept.
        if let Some(fa) = shared.final_action.get() {
            if fa.accept {
                return Ok(Auth::Accept);
            }
            return Err(self.deny(&fa.message.clone()));
        }

        if let Err(e) = self.set_info(raw_user) {
            return Err(self.deny_banner("failed to get connection info", Some(e)));
        }

        let m = match shared.evaluate_policy() {
            Ok(m) => m,
            Err(e) => return Err(self.deny_banner("failed to evaluate SSH policy", Some(e))),
        };
        let _ = shared.action0.set(m.action.clone());

        // Look up the local account early: accepts need it before the
        // session starts, and holds need it for $LOCAL_USER expansion.
        if m.action.accept || !m.action.hold_and_delegate.is_empty() {
            let lu = match lookup_local_user(&m.local_user) {
                Ok(lu) => lu,
                Err(e) => {
                    return Err(self.deny_banner(
                        &format!("failed to look up local user {:?}", m.local_user),
                        Some(e),
                    ))
                }
            };
            let gids = match user_group_ids(&lu) {
                Ok(g) => g,
                Err(e) => {
                    return Err(
                        self.deny_banner("failed to look up local user's group IDs", Some(e))
                    )
                }
            };
            let _ = shared.local_user.set(lu);
            let _ = shared.user_group_ids.set(gids);
            let _ = shared.accept_env.set(m.accept_env);
        }

        let mut act = m.action;
        loop {
            if act.accept {
                metrics.terminal_accept.inc();
                if !act.message.is_empty() {
                    self.queue_banner(&act.message);
                }
                let _ = shared.final_action.set(act);
                shared.banner.close();
                return Ok(Auth::Accept);
            }
            if act.reject {
                metrics.terminal_reject.inc();
                let message = act.message.clone();
                let _ = shared.final_action.set(act);
                return Err(self.deny(&message));
            }
            if !act.hold_and_delegate.is_empty() {
                metrics.holds.inc();
                if !act.message.is_empty() {
                    self.queue_banner(&act.message);
                }
                let url = self.expand_url(&act.hold_and_delegate);
                match action::fetch_ssh_action(
                    shared.srv.agent.as_ref(),
                    &shared.transport,
                    &url,
                )
                .await
                {
                    Ok(next) => {
                        act = next;
                        continue;
                    }
                    Err(e) => {
                        metrics.terminal_fetch_error.inc();
                        return Err(self.deny_banner(
                            "failed to fetch next SSH action",
                            Some(e.context(format!("fetch failed from {url}"))),
                        ));
                    }
                }
            }
            metrics.terminal_malformed.inc();
            return Err(self.deny_banner(
                "reached an action with neither accept, reject, nor hold-and-delegate",
                None,
            ));
        }
    }

    fn authenticated(&self) -> bool {
        self.shared
            .final_action
            .get()
            .map(|a| a.accept)
            .unwrap_or(false)
    }

    fn start_session(&mut self, channel_id: ChannelId, kind: SessionKind, session: &mut Session) {
        let Some(mut ctx) = self.channels.get_mut(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return;
        };
        if ctx.started {
            let _ = session.channel_failure(channel_id);
            return;
        }
        ctx.started = true;
        let input_rx = ctx
            .input_rx
            .take()
            .expect("session input receiver taken once");
        let ss = SshSession::new(
            self.shared.clone(),
            channel_id,
            session.handle(),
            kind,
            ctx.pty.clone(),
            ctx.env.clone(),
            ctx.agent_requested,
            input_rx,
        );
        drop(ctx);
        self.shared.srv.spawn_session(ss);
    }

    /// Reject a subsystem with a diagnostic on the channel and exit 1.
    fn refuse_subsystem(&self, channel_id: ChannelId, msg: &str, session: &mut Session) {
        let _ = session.data(channel_id, CryptoVec::from_slice(msg.as_bytes()));
        let _ = session.exit_status_request(channel_id, 1);
        let _ = session.close(channel_id);
    }
}

impl russh::server::Handler for ConnHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let auth = self.client_auth(user).await?;
        // Buggy clients get confused by success on the "none" method; a
        // +password username forces one trivial password round first. The
        // workaround applies to this method only: clients that led with a
        // credential already took their own detour.
        if matches!(auth, Auth::Accept) && user.ends_with(FORCE_PASSWORD_SUFFIX) {
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
                partial_success: true,
            });
        }
        Ok(auth)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        // Some clients skip "none" and immediately supply a password. We
        // humor them, ignoring the password's value.
        self.client_auth(user).await
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Same as password: the key's content is ignored.
        self.client_auth(user).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated() {
            return Ok(false);
        }
        self.channels.insert(channel.id(), ChannelCtx::new());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut ctx) = self.channels.get_mut(&channel) {
            ctx.pty = Some(PtyRequest {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            });
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut ctx) = self.channels.get_mut(&channel) {
            if let Some(pty) = ctx.pty.as_mut() {
                pty.cols = col_width;
                pty.rows = row_height;
            }
            let _ = ctx.input_tx.send(SessionInput::Resize {
                cols: col_width,
                rows: row_height,
            });
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accept_env = self.shared.accept_env();
        if let Some(mut ctx) = self.channels.get_mut(&channel) {
            if policy::env_accepted(&accept_env, variable_name) {
                ctx.env
                    .push((variable_name.to_string(), variable_value.to_string()));
            } else {
                debug!(
                    conn_id = %self.shared.conn_id,
                    name = variable_name,
                    "dropping env var not in accept_env"
                );
            }
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(mut ctx) = self.channels.get_mut(&channel) {
            ctx.agent_requested = true;
        }
        // Forwarding that is disabled or not allowed silently does not
        // work rather than erroring the request.
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.authenticated() {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        self.start_session(channel, SessionKind::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.authenticated() {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        let command = String::from_utf8_lossy(data).to_string();
        debug!(conn_id = %self.shared.conn_id, command = %command, "exec request");
        self.start_session(channel, SessionKind::Exec(command), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.authenticated() {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        match name {
            "sftp" => {
                if self.shared.srv.flags.disable_sftp {
                    self.refuse_subsystem(channel, "sftp disabled\r\n", session);
                    return Ok(());
                }
                self.shared.srv.metrics.sftp_sessions.inc();
                self.start_session(channel, SessionKind::Sftp, session);
            }
            other => {
                warn!(conn_id = %self.shared.conn_id, subsystem = %other, "unsupported subsystem");
                self.refuse_subsystem(
                    channel,
                    &format!("Unsupported subsystem {other:?}\r\n"),
                    session,
                );
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.authenticated() {
            return Ok(());
        }
        if let Some(ctx) = self.channels.get(&channel) {
            let _ = ctx.input_tx.send(SessionInput::Data(data.to_vec()));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ctx) = self.channels.get(&channel) {
            let _ = ctx.input_tx.send(SessionInput::Eof);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.shared.srv.flags.disable_forwarding {
            return Ok(false);
        }
        let allowed = self
            .shared
            .final_action
            .get()
            .map(|a| a.allow_local_port_forwarding)
            .unwrap_or(false);
        if !allowed {
            return Ok(false);
        }
        self.shared.srv.metrics.local_port_forward_requests.inc();
        let host = host_to_connect.to_string();
        let port = match u16::try_from(port_to_connect) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        debug!(
            conn_id = %self.shared.conn_id,
            target = %format!("{host}:{port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip channel open"
        );
        let conn_id = self.shared.conn_id.clone();
        tokio::spawn(async move {
            let mut upstream = match tokio::net::TcpStream::connect((host.as_str(), port)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(conn_id = %conn_id, target = %format!("{host}:{port}"), error = %e, "forward connect failed");
                    return;
                }
            };
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut upstream, &mut stream).await;
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.shared.srv.flags.disable_forwarding {
            return Ok(false);
        }
        let allowed = self
            .shared
            .final_action
            .get()
            .map(|a| a.allow_remote_port_forwarding)
            .unwrap_or(false);
        if allowed {
            self.shared.srv.metrics.remote_port_forward_requests.inc();
            debug!(conn_id = %self.shared.conn_id, address, port = *port, "tcpip-forward allowed");
        }
        Ok(allowed)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(conn_id = %self.shared.conn_id, address, port, "cancel-tcpip-forward");
        Ok(!self.shared.srv.flags.disable_forwarding)
    }
}
