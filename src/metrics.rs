//! Server metrics.
//!
//! One registry holding the fixed metric set. The agent scrapes the
//! registry; nothing here spawns an exporter.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Centralized metrics registry for the SSH server.
pub struct Metrics {
    pub registry: Registry,
    pub active_sessions: Gauge,
    pub incoming_connections: Counter,
    pub terminal_accept: Counter,
    pub terminal_reject: Counter,
    pub terminal_malformed: Counter,
    pub terminal_fetch_error: Counter,
    pub holds: Counter,
    pub policy_change_kick: Counter,
    pub sftp_sessions: Counter,
    pub local_port_forward_requests: Counter,
    pub remote_port_forward_requests: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_sessions = Gauge::default();
        registry.register(
            "meshssh_active_sessions",
            "Currently active SSH sessions",
            active_sessions.clone(),
        );

        let incoming_connections = Counter::default();
        registry.register(
            "meshssh_incoming_connections",
            "Total incoming SSH connections",
            incoming_connections.clone(),
        );

        let terminal_accept = Counter::default();
        registry.register(
            "meshssh_terminalaction_accept",
            "Connections resolved with a terminal Accept action",
            terminal_accept.clone(),
        );

        let terminal_reject = Counter::default();
        registry.register(
            "meshssh_terminalaction_reject",
            "Connections resolved with a terminal Reject action",
            terminal_reject.clone(),
        );

        let terminal_malformed = Counter::default();
        registry.register(
            "meshssh_terminalaction_malformed",
            "Connections that reached a malformed action",
            terminal_malformed.clone(),
        );

        let terminal_fetch_error = Counter::default();
        registry.register(
            "meshssh_terminalaction_fetch_error",
            "Connections aborted by a delegate fetch failure",
            terminal_fetch_error.clone(),
        );

        let holds = Counter::default();
        registry.register(
            "meshssh_holds",
            "Hold-and-delegate actions taken",
            holds.clone(),
        );

        let policy_change_kick = Counter::default();
        registry.register(
            "meshssh_policy_change_kick",
            "Connections kicked by a policy change",
            policy_change_kick.clone(),
        );

        let sftp_sessions = Counter::default();
        registry.register(
            "meshssh_sftp_sessions",
            "Accepted sftp subsystem sessions",
            sftp_sessions.clone(),
        );

        let local_port_forward_requests = Counter::default();
        registry.register(
            "meshssh_local_port_forward_requests",
            "Allowed local port forward requests",
            local_port_forward_requests.clone(),
        );

        let remote_port_forward_requests = Counter::default();
        registry.register(
            "meshssh_remote_port_forward_requests",
            "Allowed remote port forward requests",
            remote_port_forward_requests.clone(),
        );

        Self {
            registry,
            active_sessions,
            incoming_connections,
            terminal_accept,
            terminal_reject,
            terminal_malformed,
            terminal_fetch_error,
            holds,
            policy_change_kick,
            sftp_sessions,
            local_port_forward_requests,
            remote_port_forward_requests,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
