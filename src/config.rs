//! Environment-driven behavior flags.
//!
//! The server is embedded in the node agent, so it has no config file or
//! CLI of its own; debug and behavior knobs are read from `MESHSSH_*`
//! environment variables once, when the server is constructed.

use std::path::PathBuf;

/// Default sftp-server binary used for the `sftp` subsystem.
const DEFAULT_SFTP_SERVER: &str = "/usr/lib/openssh/sftp-server";

/// Behavior flags, captured from the environment at server construction.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Verbose decision-point logging (`MESHSSH_VLOG`).
    pub verbose: bool,
    /// Refuse the sftp subsystem (`MESHSSH_DISABLE_SFTP`).
    pub disable_sftp: bool,
    /// Deny local/remote port forwarding and agent forwarding
    /// (`MESHSSH_DISABLE_FORWARDING`).
    pub disable_forwarding: bool,
    /// Reserved; not honored in the core I/O path (`MESHSSH_DISABLE_PTY`).
    pub disable_pty: bool,
    /// JSON policy file used when the mesh map supplies no policy
    /// (`MESHSSH_POLICY_FILE`).
    pub policy_file: Option<PathBuf>,
    /// Force the file-based debug policy even when the mesh map has one
    /// (`MESHSSH_IGNORE_MESH_POLICY`).
    pub ignore_mesh_policy: bool,
    /// Record sessions to local disk when no remote recorders are
    /// configured (`MESHSSH_RECORD_LOCAL`).
    pub record_to_local_disk: bool,
    /// Binary spawned for sftp sessions (`MESHSSH_SFTP_SERVER`).
    pub sftp_server_path: PathBuf,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            verbose: false,
            disable_sftp: false,
            disable_forwarding: false,
            disable_pty: false,
            policy_file: None,
            ignore_mesh_policy: false,
            record_to_local_disk: false,
            sftp_server_path: PathBuf::from(DEFAULT_SFTP_SERVER),
        }
    }
}

impl Flags {
    /// Read all flags from the process environment.
    pub fn from_env() -> Self {
        Self {
            verbose: parse_bool_env("MESHSSH_VLOG", false),
            disable_sftp: parse_bool_env("MESHSSH_DISABLE_SFTP", false),
            disable_forwarding: parse_bool_env("MESHSSH_DISABLE_FORWARDING", false),
            disable_pty: parse_bool_env("MESHSSH_DISABLE_PTY", false),
            policy_file: opt_env("MESHSSH_POLICY_FILE").map(PathBuf::from),
            ignore_mesh_policy: parse_bool_env("MESHSSH_IGNORE_MESH_POLICY", false),
            record_to_local_disk: parse_bool_env("MESHSSH_RECORD_LOCAL", false),
            sftp_server_path: opt_env("MESHSSH_SFTP_SERVER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SFTP_SERVER)),
        }
    }
}

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    opt_env(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
