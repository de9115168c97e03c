//! The server shell: accepts raw connections, tracks active connections,
//! gates new sessions on shutdown, and coordinates graceful drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::NodeAgent;
use crate::config::Flags;
use crate::conn::{new_id, ConnHandler, ConnShared};
use crate::metrics::Metrics;
use crate::session::{SshSession, TerminationCause};

pub(crate) struct ServerState {
    pub(crate) shutdown: bool,
    pub(crate) active: HashMap<String, Arc<ConnShared>>,
}

/// Server internals shared with every connection.
pub struct ServerInner {
    pub(crate) agent: Arc<dyn NodeAgent>,
    pub(crate) flags: Flags,
    pub(crate) metrics: Arc<Metrics>,
    // Guards the shutdown flag and the active-connection set. This lock is
    // always acquired before any per-connection lock.
    state: StdMutex<ServerState>,
    /// Wait-group for attached session tasks.
    sessions: TaskTracker,
    skip_mesh_addr_check: AtomicBool,
}

impl ServerInner {
    pub(crate) fn state_lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn skip_mesh_addr_check(&self) -> bool {
        self.skip_mesh_addr_check.load(Ordering::Relaxed)
    }

    pub(crate) fn spawn_session(&self, ss: SshSession) {
        self.sessions.spawn(ss.run());
    }
}

/// The identity-aware SSH server embedded in the node agent.
#[derive(Clone)]
pub struct SshServer {
    inner: Arc<ServerInner>,
}

impl SshServer {
    pub fn new(agent: Arc<dyn NodeAgent>, flags: Flags) -> Self {
        Self::with_metrics(agent, flags, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(agent: Arc<dyn NodeAgent>, flags: Flags, metrics: Arc<Metrics>) -> Self {
        if flags.verbose {
            info!("verbose SSH decision logging enabled");
        }
        Self {
            inner: Arc::new(ServerInner {
                agent,
                flags,
                metrics,
                state: StdMutex::new(ServerState {
                    shutdown: false,
                    active: HashMap::new(),
                }),
                sessions: TaskTracker::new(),
                skip_mesh_addr_check: AtomicBool::new(false),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Test helper: accept connections from outside the mesh address
    /// range (identity still resolves through the agent's whois).
    pub fn set_skip_mesh_addr_check(&self, skip: bool) {
        self.inner
            .skip_mesh_addr_check
            .store(skip, Ordering::Relaxed);
    }

    /// The number of active SSH connections.
    pub fn num_active_conns(&self) -> usize {
        self.inner.state_lock().active.len()
    }

    pub(crate) fn inner(&self) -> Arc<ServerInner> {
        self.inner.clone()
    }

    /// Handle one raw SSH connection. This is the entry point for all SSH
    /// connections; it returns once the connection is closed.
    pub async fn handle_ssh_conn(&self, stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        let src = stream.peer_addr()?;
        let dst = stream.local_addr()?;
        self.handle_conn_io(stream, src, dst).await
    }

    /// Like [`SshServer::handle_ssh_conn`] but over any byte stream, with
    /// the peer and local addresses supplied by the caller (the agent's
    /// netstack knows them even when the transport is not a socket).
    pub async fn handle_conn_io<S>(
        &self,
        stream: S,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.inner.metrics.incoming_connections.inc();
        {
            let st = self.inner.state_lock();
            if st.shutdown {
                // Stop accepting new connections; existing sessions are
                // torn down by shutdown itself.
                anyhow::bail!("server is shutting down");
            }
        }

        let conn_id = new_id("ssh-conn", self.inner.agent.now());
        let shared = Arc::new(ConnShared::new(conn_id.clone(), self.inner(), src, dst));
        self.inner
            .state_lock()
            .active
            .insert(conn_id.clone(), shared.clone());

        let result = self.drive_conn(stream, shared.clone()).await;

        self.inner.state_lock().active.remove(&conn_id);
        match result {
            Ok(()) => debug!(conn_id = %conn_id, "connection closed"),
            // Terminal auth denials surface here as handler errors; the
            // denial was already logged with its reason.
            Err(e) => debug!(conn_id = %conn_id, error = %format!("{e:#}"), "connection ended"),
        }
        Ok(())
    }

    async fn drive_conn<S>(&self, stream: S, shared: Arc<ConnShared>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut config = russh::server::Config::default();
        config.server_id = russh::SshId::Standard("SSH-2.0-meshssh".to_string());
        config.keys = self.inner.agent.host_keys()?;
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::ZERO);
        // Identity auth runs behind every method; "none" must be offered
        // so well-behaved clients resolve without ever sending credentials.
        config.methods = russh::MethodSet::from(
            [
                russh::MethodKind::None,
                russh::MethodKind::Password,
                russh::MethodKind::PublicKey,
            ]
            .as_slice(),
        );
        let config = Arc::new(config);

        let handler = ConnHandler::new(shared.clone());
        let session = russh::server::run_stream(config, stream, handler).await?;
        tokio::select! {
            r = session => {
                r?;
            }
            _ = shared.transport.cancelled() => {
                debug!(conn_id = %shared.conn_id, "transport canceled");
            }
        }
        Ok(())
    }

    /// Terminate all active sessions and refuse new work, then wait for
    /// every attached session to finish.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<ConnShared>> = {
            let mut st = self.inner.state_lock();
            st.shutdown = true;
            st.active.values().cloned().collect()
        };
        info!(active = conns.len(), "meshssh shutting down");
        for conn in conns {
            conn.cancel_all_sessions(TerminationCause::ServerShutdown);
            conn.transport.cancel();
        }
        self.inner.sessions.close();
        self.inner.sessions.wait().await;
        info!("meshssh shutdown complete");
    }

    /// Re-evaluate every authenticated connection against the current
    /// policy, terminating the ones that no longer match.
    pub fn on_policy_change(&self) {
        let conns: Vec<Arc<ConnShared>> = {
            let st = self.inner.state_lock();
            st.active.values().cloned().collect()
        };
        for conn in conns {
            if conn.info().is_none() {
                // Not authenticated yet; auth will apply the new policy.
                continue;
            }
            tokio::spawn(async move {
                conn.check_still_valid();
            });
        }
    }

    /// Accept loop convenience for standalone use: serve connections from
    /// `listener` until shutdown.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            if self.inner.state_lock().shutdown {
                return Ok(());
            }
            debug!(peer = %peer, "new SSH connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_ssh_conn(stream).await {
                    warn!(peer = %peer, error = %e, "connection refused");
                }
            });
        }
    }
}
