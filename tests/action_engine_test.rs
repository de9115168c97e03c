//! The hold-loop fetch combinator: retry on transient failures, overall
//! deadline, cancellation. Runs under paused time so the backoff sleeps
//! are virtual.

#[allow(dead_code)]
mod common;

use common::*;
use meshssh::action::{fetch_ssh_action, SshAction};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn fetch_returns_decoded_action() {
    let agent = FakeAgent::new(accept_any_policy());
    agent.push_action_response(&SshAction::accept());

    let cancel = CancellationToken::new();
    let action = fetch_ssh_action(agent.as_ref(), &cancel, "https://ctl/x")
        .await
        .unwrap();
    assert!(action.accept);
}

#[tokio::test(start_paused = true)]
async fn fetch_retries_non_200_then_succeeds() {
    let agent = FakeAgent::new(accept_any_policy());
    agent.push_control_response(500, b"internal error".to_vec());
    agent.push_control_response(503, b"try later".to_vec());
    agent.push_action_response(&SshAction::reject("final"));

    let cancel = CancellationToken::new();
    let action = fetch_ssh_action(agent.as_ref(), &cancel, "https://ctl/x")
        .await
        .unwrap();
    assert!(action.reject);
    assert_eq!(agent.requested_urls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn fetch_retries_bad_json() {
    let agent = FakeAgent::new(accept_any_policy());
    agent.push_control_response(200, b"{not json".to_vec());
    agent.push_action_response(&SshAction::accept());

    let cancel = CancellationToken::new();
    let action = fetch_ssh_action(agent.as_ref(), &cancel, "https://ctl/x")
        .await
        .unwrap();
    assert!(action.accept);
}

#[tokio::test(start_paused = true)]
async fn fetch_gives_up_at_deadline() {
    // Transport errors forever: no scripted responses at all.
    let agent = FakeAgent::new(accept_any_policy());
    let cancel = CancellationToken::new();
    let err = fetch_ssh_action(agent.as_ref(), &cancel, "https://ctl/x")
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("deadline"),
        "unexpected error: {err:#}"
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_aborts_on_cancellation() {
    let agent = FakeAgent::new(accept_any_policy());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = fetch_ssh_action(agent.as_ref(), &cancel, "https://ctl/x")
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("canceled"),
        "unexpected error: {err:#}"
    );
}
