//! Policy-change revocation and graceful shutdown against live sessions.

#[allow(dead_code)]
mod common;

use common::*;
use meshssh::Flags;
use tokio::time::{sleep, timeout, Duration};

#[tokio::test]
async fn policy_change_revokes_running_session() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent.clone(), Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 30").await.unwrap();

    // Let the child start before yanking the policy.
    sleep(Duration::from_millis(300)).await;

    // New policy matches nothing; the connection is no longer valid.
    agent.set_policy(Some(meshssh::SshPolicy::default()));
    ts.server.on_policy_change();

    let out = timeout(Duration::from_secs(10), collect_channel(channel))
        .await
        .expect("session should be torn down promptly");
    assert!(
        out.stderr_str().contains("Access revoked."),
        "stderr: {:?}",
        out.stderr_str()
    );
    assert_eq!(out.exit_status, Some(1));
    assert_eq!(ts.server.metrics().policy_change_kick.get(), 1);
}

#[tokio::test]
async fn policy_change_keeps_still_valid_connections() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent.clone(), Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 1 && echo survived").await.unwrap();

    sleep(Duration::from_millis(200)).await;

    // The same policy still matches; nothing should be kicked.
    ts.server.on_policy_change();

    let out = timeout(Duration::from_secs(10), collect_channel(channel))
        .await
        .expect("session finishes normally");
    assert!(out.stdout_str().contains("survived"));
    assert_eq!(out.exit_status, Some(0));
    assert_eq!(ts.server.metrics().policy_change_kick.get(), 0);
}

#[tokio::test]
async fn session_duration_cancels_with_timeout_message() {
    let mut action = meshssh::SshAction::accept();
    action.session_duration_secs = Some(1);
    let policy = meshssh::SshPolicy {
        rules: vec![accept_any_rule(action)],
    };
    let agent = FakeAgent::new(policy);
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 30").await.unwrap();

    let out = timeout(Duration::from_secs(10), collect_channel(channel))
        .await
        .expect("duration timer should fire");
    assert!(
        out.stderr_str().contains("Session timeout of 1s elapsed."),
        "stderr: {:?}",
        out.stderr_str()
    );
    assert_eq!(out.exit_status, Some(1));
}

#[tokio::test]
async fn shutdown_drains_active_sessions() {
    let agent = FakeAgent::new(accept_any_policy());
    let ts = start_server(agent, Flags::default()).await;

    let mut handle = connect_client(ts.port).await;
    let auth = handle.authenticate_none(current_username()).await.unwrap();
    assert!(auth.success());
    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 30").await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(ts.server.num_active_conns(), 1);

    // Shutdown kills the session's child and waits for the supervisor.
    timeout(Duration::from_secs(10), ts.server.shutdown())
        .await
        .expect("shutdown should drain promptly");

    assert_eq!(ts.server.metrics().active_sessions.get(), 0);
}
