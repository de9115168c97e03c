//! End-to-end authentication and policy decisions over a real SSH
//! transport: direct accept, rejection, non-mesh source, subsystem and
//! forwarding gates.

#[allow(dead_code)]
mod common;

use common::*;
use meshssh::{Flags, SshAction};

// ---------------------------------------------------------------------------
// Direct accept: any principal, identity mapping, exit code 0
// ---------------------------------------------------------------------------
#[tokio::test]
async fn direct_accept_runs_command() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let out = exec_as_current_user(ts.port, "echo meshssh-ok").await;
    assert!(
        out.stdout_str().contains("meshssh-ok"),
        "stdout: {:?}",
        out.stdout_str()
    );
    assert_eq!(out.exit_status, Some(0));

    let metrics = ts.server.metrics();
    assert_eq!(metrics.terminal_accept.get(), 1);
    assert_eq!(metrics.terminal_reject.get(), 0);
    assert_eq!(metrics.incoming_connections.get(), 1);
}

#[tokio::test]
async fn exec_propagates_nonzero_exit_code() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let out = exec_as_current_user(ts.port, "exit 3").await;
    assert_eq!(out.exit_status, Some(3));
}

// ---------------------------------------------------------------------------
// Rejection: transport terminates with no further auth methods
// ---------------------------------------------------------------------------
#[tokio::test]
async fn reject_terminates_transport() {
    let agent = FakeAgent::new(reject_policy("go away"));
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let result = handle.authenticate_none(current_username()).await;
    // The server tears the transport down rather than offering another
    // method; the client sees either a failed auth or a dead transport.
    match result {
        Ok(auth) => assert!(!auth.success()),
        Err(_) => {}
    }

    let metrics = ts.server.metrics();
    assert_eq!(metrics.terminal_reject.get(), 1);
    assert_eq!(metrics.terminal_accept.get(), 0);

    // No session ever attaches on a rejected connection.
    assert_eq!(metrics.active_sessions.get(), 0);
}

#[tokio::test]
async fn no_matching_rule_is_denied() {
    // A rule that maps no users never matches a non-reject action.
    let mut policy = accept_any_policy();
    policy.rules[0].ssh_users.clear();
    let agent = FakeAgent::new(policy);
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let result = handle.authenticate_none(current_username()).await;
    match result {
        Ok(auth) => assert!(!auth.success()),
        Err(_) => {}
    }
    assert_eq!(ts.server.metrics().terminal_accept.get(), 0);
}

// ---------------------------------------------------------------------------
// Non-mesh source address: rejected before ConnInfo exists
// ---------------------------------------------------------------------------
#[tokio::test]
async fn non_mesh_source_is_rejected() {
    let agent = FakeAgent::new(accept_any_policy());
    // Do not skip the mesh address check: loopback is outside the range.
    let ts = start_server_opts(agent, Flags::default(), false).await;

    let mut handle = connect_client(ts.port).await;
    let result = handle.authenticate_none(current_username()).await;
    match result {
        Ok(auth) => assert!(!auth.success()),
        Err(_) => {}
    }

    let metrics = ts.server.metrics();
    // The denial happens before any terminal action is reached.
    assert_eq!(metrics.terminal_accept.get(), 0);
    assert_eq!(metrics.terminal_reject.get(), 0);
}

// ---------------------------------------------------------------------------
// Policy file override
// ---------------------------------------------------------------------------
#[tokio::test]
async fn policy_file_used_when_mesh_map_has_none() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.json");
    std::fs::write(
        &policy_path,
        serde_json::to_vec(&accept_any_policy()).unwrap(),
    )
    .unwrap();

    let agent = FakeAgent::new(accept_any_policy());
    agent.set_policy(None); // the mesh map carries no policy
    let flags = Flags {
        policy_file: Some(policy_path),
        ..Flags::default()
    };
    let ts = start_server(agent, flags).await;

    let out = exec_as_current_user(ts.port, "echo from-file-policy").await;
    assert!(out.stdout_str().contains("from-file-policy"));
    assert_eq!(out.exit_status, Some(0));
}

#[tokio::test]
async fn ignore_mesh_policy_forces_file_policy() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.json");
    std::fs::write(
        &policy_path,
        serde_json::to_vec(&accept_any_policy()).unwrap(),
    )
    .unwrap();

    // The mesh map says reject; the debug override must win.
    let agent = FakeAgent::new(reject_policy("mesh says no"));
    let flags = Flags {
        policy_file: Some(policy_path),
        ignore_mesh_policy: true,
        ..Flags::default()
    };
    let ts = start_server(agent, flags).await;

    let out = exec_as_current_user(ts.port, "true").await;
    assert_eq!(out.exit_status, Some(0));
    assert_eq!(ts.server.metrics().terminal_reject.get(), 0);
}

// ---------------------------------------------------------------------------
// Buggy-client workaround: +password forces a trivial password round
// ---------------------------------------------------------------------------
#[tokio::test]
async fn force_password_suffix_runs_password_round() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let user = format!("{}+password", current_username());
    let mut handle = connect_client(ts.port).await;

    // The none method reports partial success rather than full success.
    let first = handle.authenticate_none(user.clone()).await.unwrap();
    assert!(!first.success());

    // Any password is accepted; auth already happened by identity.
    let second = handle
        .authenticate_password(user, "whatever")
        .await
        .unwrap();
    assert!(second.success());

    // The suffix is stripped from the mapped username.
    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "echo suffixed-ok").await.unwrap();
    let out = collect_channel(channel).await;
    assert!(out.stdout_str().contains("suffixed-ok"));
    assert_eq!(out.exit_status, Some(0));
}

#[tokio::test]
async fn force_password_suffix_ignored_when_password_method_leads() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let user = format!("{}+password", current_username());
    let mut handle = connect_client(ts.port).await;

    // The workaround is scoped to the none method: a client that leads
    // with a password already supplied a credential and must be accepted
    // outright, with no partial-success round-trip.
    let auth = handle
        .authenticate_password(user, "whatever")
        .await
        .unwrap();
    assert!(auth.success(), "password-first auth should accept directly");

    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "echo password-first-ok").await.unwrap();
    let out = collect_channel(channel).await;
    assert!(out.stdout_str().contains("password-first-ok"));
    assert_eq!(out.exit_status, Some(0));
}

// ---------------------------------------------------------------------------
// Subsystem gate
// ---------------------------------------------------------------------------
#[tokio::test]
async fn unsupported_subsystem_prints_diagnostic_and_exits_1() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "netconf").await.unwrap();
    let out = collect_channel(channel).await;
    assert!(
        out.stdout_str().contains("Unsupported subsystem"),
        "stdout: {:?}",
        out.stdout_str()
    );
    assert_eq!(out.exit_status, Some(1));
}

#[tokio::test]
async fn sftp_subsystem_refused_when_disabled() {
    let agent = FakeAgent::new(accept_any_policy());
    let flags = Flags {
        disable_sftp: true,
        ..Flags::default()
    };
    let ts = start_server(agent, flags).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let out = collect_channel(channel).await;
    assert!(out.stdout_str().contains("sftp disabled"));
    assert_eq!(out.exit_status, Some(1));
    assert_eq!(ts.server.metrics().sftp_sessions.get(), 0);
}

// ---------------------------------------------------------------------------
// Forwarding gates
// ---------------------------------------------------------------------------
#[tokio::test]
async fn direct_tcpip_denied_without_action_flag() {
    // The default accept action does not allow local port forwarding.
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());

    let result = handle
        .channel_open_direct_tcpip("127.0.0.1", 9, "127.0.0.1", 40000)
        .await;
    assert!(result.is_err(), "direct-tcpip should be refused");
    assert_eq!(ts.server.metrics().local_port_forward_requests.get(), 0);
}

#[tokio::test]
async fn direct_tcpip_allowed_by_action_flag() {
    let action = SshAction {
        allow_local_port_forwarding: true,
        ..SshAction::accept()
    };
    let policy = meshssh::SshPolicy {
        rules: vec![accept_any_rule(action)],
    };
    let agent = FakeAgent::new(policy);
    let ts = start_server(agent, Flags::default()).await;

    // A local echo target for the forwarded connection.
    let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = target.accept().await {
            let (mut r, mut w) = sock.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    });

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());

    let mut channel = handle
        .channel_open_direct_tcpip("127.0.0.1", target_port as u32, "127.0.0.1", 40000)
        .await
        .expect("direct-tcpip should be accepted");
    channel.data(&b"ping"[..]).await.unwrap();

    let mut echoed = Vec::new();
    let deadline = tokio::time::Duration::from_secs(5);
    loop {
        match tokio::time::timeout(deadline, channel.wait()).await {
            Ok(Some(russh::ChannelMsg::Data { ref data })) => {
                echoed.extend_from_slice(data);
                if echoed == b"ping" {
                    break;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    assert_eq!(echoed, b"ping");
    assert_eq!(ts.server.metrics().local_port_forward_requests.get(), 1);
}

#[tokio::test]
async fn forwarding_flag_disables_even_allowed_actions() {
    let action = SshAction {
        allow_local_port_forwarding: true,
        ..SshAction::accept()
    };
    let policy = meshssh::SshPolicy {
        rules: vec![accept_any_rule(action)],
    };
    let agent = FakeAgent::new(policy);
    let flags = Flags {
        disable_forwarding: true,
        ..Flags::default()
    };
    let ts = start_server(agent, flags).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let result = handle
        .channel_open_direct_tcpip("127.0.0.1", 9, "127.0.0.1", 40000)
        .await;
    assert!(result.is_err());
}
