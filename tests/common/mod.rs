//! Shared test harness: a scriptable fake node agent and helpers for
//! running the server against a real russh client over loopback TCP.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::ChannelMsg;

use meshssh::agent::{
    BoxedConn, ControlRequest, ControlResponse, MeshMap, NodeAgent, NodePublicKey, NodeView,
    UserProfile,
};
use meshssh::policy::{SshPolicy, SshPrincipal, SshRule};
use meshssh::{Flags, SshAction, SshServer};

/// Node agent stand-in with a swappable policy and scripted control
/// channel.
pub struct FakeAgent {
    pub self_node_id: i64,
    policy: Mutex<Option<SshPolicy>>,
    identity: (NodeView, UserProfile),
    control_responses: Mutex<VecDeque<ControlResponse>>,
    control_requests: Mutex<Vec<ControlRequest>>,
    var_root: Option<PathBuf>,
    host_key: OnceLock<russh::keys::PrivateKey>,
}

impl FakeAgent {
    fn base(policy: SshPolicy) -> Self {
        Self {
            self_node_id: 3,
            policy: Mutex::new(Some(policy)),
            identity: (
                NodeView {
                    id: 7,
                    stable_id: "n-abc123".to_string(),
                    name: "peer.example.mesh.".to_string(),
                    user_id: 1001,
                    tags: vec![],
                },
                UserProfile {
                    id: 1001,
                    login_name: "alice@example.com".to_string(),
                    display_name: "Alice".to_string(),
                },
            ),
            control_responses: Mutex::new(VecDeque::new()),
            control_requests: Mutex::new(Vec::new()),
            var_root: None,
            host_key: OnceLock::new(),
        }
    }

    pub fn new(policy: SshPolicy) -> Arc<Self> {
        Arc::new(Self::base(policy))
    }

    pub fn with_var_root(policy: SshPolicy, var_root: PathBuf) -> Arc<Self> {
        let mut agent = Self::base(policy);
        agent.var_root = Some(var_root);
        Arc::new(agent)
    }

    pub fn set_policy(&self, policy: Option<SshPolicy>) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn push_control_response(&self, status: u16, body: Vec<u8>) {
        self.control_responses
            .lock()
            .unwrap()
            .push_back(ControlResponse { status, body });
    }

    pub fn push_action_response(&self, action: &SshAction) {
        self.push_control_response(200, serde_json::to_vec(action).unwrap());
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.control_requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }
}

#[async_trait]
impl NodeAgent for FakeAgent {
    fn host_keys(&self) -> anyhow::Result<Vec<russh::keys::PrivateKey>> {
        let key = self
            .host_key
            .get_or_init(|| {
                russh::keys::PrivateKey::random(
                    &mut rand::rngs::OsRng,
                    russh::keys::Algorithm::Ed25519,
                )
                .expect("host key generation")
            })
            .clone();
        Ok(vec![key])
    }

    fn should_serve_ssh(&self) -> bool {
        true
    }

    fn mesh_map(&self) -> Option<MeshMap> {
        Some(MeshMap {
            self_node_id: self.self_node_id,
            ssh_policy: self.policy.lock().unwrap().clone(),
        })
    }

    fn whois(&self, _proto: &str, _addr: SocketAddr) -> Option<(NodeView, UserProfile)> {
        Some(self.identity.clone())
    }

    async fn do_control_request(&self, req: ControlRequest) -> anyhow::Result<ControlResponse> {
        self.control_requests.lock().unwrap().push(req);
        match self.control_responses.lock().unwrap().pop_front() {
            Some(resp) => Ok(resp),
            None => anyhow::bail!("no scripted control response"),
        }
    }

    async fn user_dial(&self, _addr: SocketAddr) -> std::io::Result<BoxedConn> {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "recorder unreachable",
        ))
    }

    fn var_root(&self) -> Option<PathBuf> {
        self.var_root.clone()
    }

    fn node_key(&self) -> NodePublicKey {
        NodePublicKey("nodekey:fake0123".to_string())
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The username the test process runs as; sessions launch as this user so
/// the supervisor's uid check passes without privileges.
pub fn current_username() -> String {
    let uid = nix::unistd::geteuid();
    nix::unistd::User::from_uid(uid)
        .expect("uid lookup")
        .expect("current user exists")
        .name
}

pub fn accept_any_rule(action: SshAction) -> SshRule {
    SshRule {
        principals: vec![SshPrincipal {
            any: true,
            ..Default::default()
        }],
        ssh_users: HashMap::from([("*".to_string(), "=".to_string())]),
        action: Some(action),
        ..Default::default()
    }
}

pub fn accept_any_policy() -> SshPolicy {
    SshPolicy {
        rules: vec![accept_any_rule(SshAction::accept())],
    }
}

pub fn reject_policy(message: &str) -> SshPolicy {
    SshPolicy {
        rules: vec![SshRule {
            principals: vec![SshPrincipal {
                any: true,
                ..Default::default()
            }],
            action: Some(SshAction::reject(message)),
            ..Default::default()
        }],
    }
}

pub struct TestServer {
    pub server: SshServer,
    pub port: u16,
    pub _accept_task: tokio::task::JoinHandle<()>,
}

/// Start the server on an OS-assigned loopback port. The mesh address
/// check is skipped (loopback is not a mesh address); identity still
/// resolves through the fake agent.
pub async fn start_server(agent: Arc<FakeAgent>, flags: Flags) -> TestServer {
    start_server_opts(agent, flags, true).await
}

pub async fn start_server_opts(
    agent: Arc<FakeAgent>,
    flags: Flags,
    skip_mesh_addr_check: bool,
) -> TestServer {
    let server = SshServer::new(agent, flags);
    server.set_skip_mesh_addr_check(skip_mesh_addr_check);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let port = listener.local_addr().unwrap().port();
    let srv = server.clone();
    let accept_task = tokio::spawn(async move {
        let _ = srv.serve(listener).await;
    });
    TestServer {
        server,
        port,
        _accept_task: accept_task,
    }
}

/// Minimal russh client handler that trusts any host key.
pub struct TestClientHandler;

impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub async fn connect_client(port: u16) -> russh::client::Handle<TestClientHandler> {
    let config = Arc::new(russh::client::Config::default());
    russh::client::connect(config, format!("127.0.0.1:{port}"), TestClientHandler)
        .await
        .expect("client connect")
}

/// Everything a session channel produced, in arrival order per stream.
#[derive(Debug, Default)]
pub struct ChannelOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ChannelOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Drain a client channel until it closes (or 10s pass).
pub async fn collect_channel(
    mut channel: russh::Channel<russh::client::Msg>,
) -> ChannelOutput {
    let mut out = ChannelOutput::default();
    let deadline = tokio::time::Duration::from_secs(10);
    loop {
        let msg = match tokio::time::timeout(deadline, channel.wait()).await {
            Ok(Some(msg)) => msg,
            Ok(None) | Err(_) => break,
        };
        match msg {
            ChannelMsg::Data { ref data } => out.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => out.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
            _ => {}
        }
    }
    out
}

/// Exec `command` as the current user and collect the channel output.
pub async fn exec_as_current_user(port: u16, command: &str) -> ChannelOutput {
    let mut handle = connect_client(port).await;
    let auth = handle
        .authenticate_none(current_username())
        .await
        .expect("auth transport");
    assert!(auth.success(), "identity auth should succeed");
    let channel = handle.channel_open_session().await.expect("open session");
    channel.exec(true, command).await.expect("exec request");
    collect_channel(channel).await
}
