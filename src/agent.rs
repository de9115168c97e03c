//! The node-agent collaborator interface.
//!
//! The SSH server never talks to the network or the coordination server
//! directly: identity resolution, host keys, the authenticated control
//! channel, and mesh dialing all come from the surrounding node agent
//! through [`NodeAgent`]. Tests implement the trait with a fake.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::policy::SshPolicy;

/// Capability version reported in control-plane notifications.
pub const CAPABILITY_VERSION: u32 = 1;

// The overlay assigns IPv4 addresses from the CGNAT range and IPv6
// addresses from ULA space; identity is only bound to such addresses.
static MESH_RANGE_V4: LazyLock<Ipv4Net> =
    LazyLock::new(|| "100.64.0.0/10".parse().expect("valid mesh v4 range"));
static MESH_RANGE_V6: LazyLock<Ipv6Net> =
    LazyLock::new(|| "fc00::/7".parse().expect("valid mesh v6 range"));

/// Reports whether `ip` lies in the mesh address space.
pub fn is_mesh_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => MESH_RANGE_V4.contains(&v4),
        IpAddr::V6(v6) => MESH_RANGE_V6.contains(&v6),
    }
}

/// A peer node as resolved by the agent's WhoIs lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Numeric node ID, shared with the coordination server.
    pub id: i64,
    /// Stable node identifier, matched by rule principals.
    pub stable_id: String,
    /// DNS name of the node (possibly with a trailing dot).
    pub name: String,
    /// Owning user ID; meaningless for tagged nodes.
    pub user_id: i64,
    /// ACL tags. Non-empty means the node is tagged rather than user-owned.
    pub tags: Vec<String>,
}

impl NodeView {
    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }
}

/// The user profile behind a peer node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub login_name: String,
    pub display_name: String,
}

/// The subset of the agent's network map the SSH server consumes.
#[derive(Debug, Clone, Default)]
pub struct MeshMap {
    /// Numeric ID of the local node, used in delegate URL expansion.
    pub self_node_id: i64,
    /// The centrally distributed SSH policy, if any.
    pub ssh_policy: Option<SshPolicy>,
}

/// The local node's public key, as reported to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePublicKey(pub String);

impl NodePublicKey {
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }
}

/// HTTP method for a control-channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    Get,
    Post,
}

/// A request sent over the agent's authenticated control channel.
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub method: ControlMethod,
    pub url: String,
    pub body: Vec<u8>,
}

impl ControlRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: ControlMethod::Get,
            url: url.into(),
            body: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: ControlMethod::Post,
            url: url.into(),
            body,
        }
    }
}

/// A response from the control channel.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Byte stream dialed through the mesh on behalf of the user.
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

pub type BoxedConn = Box<dyn AsyncConn>;

/// The node agent, as seen by the SSH server.
///
/// All clock reads go through [`NodeAgent::now`] so the agent can apply
/// its control-plane time adjustment and tests can inject a fixed clock.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// SSH host keys for the local node.
    fn host_keys(&self) -> anyhow::Result<Vec<russh::keys::PrivateKey>>;

    /// Whether this node should serve SSH at all.
    fn should_serve_ssh(&self) -> bool;

    /// Current network map, or `None` before the first map arrives.
    fn mesh_map(&self) -> Option<MeshMap>;

    /// Resolve the mesh identity behind `addr`, or `None` if unknown.
    fn whois(&self, proto: &str, addr: SocketAddr) -> Option<(NodeView, UserProfile)>;

    /// Perform an HTTP request over the authenticated control channel.
    async fn do_control_request(&self, req: ControlRequest) -> anyhow::Result<ControlResponse>;

    /// Dial `addr` through the mesh as user traffic (used for recorders).
    async fn user_dial(&self, addr: SocketAddr) -> std::io::Result<BoxedConn>;

    /// The agent's persistent state directory, if it has one.
    fn var_root(&self) -> Option<PathBuf>;

    /// The local node's public key.
    fn node_key(&self) -> NodePublicKey;

    /// Control-adjusted current time.
    fn now(&self) -> DateTime<Utc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_range_v4() {
        assert!(is_mesh_ip("100.64.0.1".parse().unwrap()));
        assert!(is_mesh_ip("100.127.255.254".parse().unwrap()));
        assert!(!is_mesh_ip("100.128.0.1".parse().unwrap()));
        assert!(!is_mesh_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_mesh_ip("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn mesh_range_v6() {
        assert!(is_mesh_ip("fd7a:115c:a1e0::1".parse().unwrap()));
        assert!(!is_mesh_ip("2001:db8::1".parse().unwrap()));
        assert!(!is_mesh_ip("::1".parse().unwrap()));
    }

    #[test]
    fn tagged_node() {
        let mut node = NodeView::default();
        assert!(!node.is_tagged());
        node.tags.push("tag:web".to_string());
        assert!(node.is_tagged());
    }
}
