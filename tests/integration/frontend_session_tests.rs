//! Chat intake and relay handling of the front-end session.

use std::sync::Arc;

use slack_kernel_relay::frontend::session::{DEAD_NOTICE, READY_NOTICE};
use slack_kernel_relay::models::envelope::Envelope;
use slack_kernel_relay::models::identity::Identity;
use slack_kernel_relay::relay::RelayHandler;

use super::test_helpers::{drain, session_with, RecordingSink, SinkCall};

#[tokio::test]
async fn chat_text_is_forwarded_as_execute() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, mut rx) = session_with(Arc::clone(&sink), dir.path());

    session.on_chat_message("C1", "x = 21 * 2").await;

    assert_eq!(
        drain(&mut rx),
        vec![(Identity::KernelManager, Envelope::execute("x = 21 * 2"))]
    );
    assert_eq!(session.channels().await, vec!["C1".to_owned()]);
    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn autolinks_are_stripped_before_forwarding() {
    let dir = tempfile::tempdir().unwrap();
    let (session, mut rx) = session_with(Arc::new(RecordingSink::default()), dir.path());

    session.on_chat_message("C1", "!curl <https://example.com>").await;

    assert_eq!(
        drain(&mut rx),
        vec![(Identity::KernelManager, Envelope::execute("!curl https://example.com"))]
    );
}

#[tokio::test]
async fn version_command_sends_probe() {
    let dir = tempfile::tempdir().unwrap();
    let (session, mut rx) = session_with(Arc::new(RecordingSink::default()), dir.path());

    session.on_chat_message("C1", ".kernel version").await;

    assert_eq!(
        drain(&mut rx),
        vec![(Identity::KernelManager, Envelope::execute("!python --version"))]
    );
}

#[tokio::test]
async fn status_command_pings_kernel_manager() {
    let dir = tempfile::tempdir().unwrap();
    let (session, mut rx) = session_with(Arc::new(RecordingSink::default()), dir.path());

    session.on_chat_message("C1", ".kernel status").await;

    assert_eq!(drain(&mut rx), vec![(Identity::KernelManager, Envelope::status(None))]);
}

#[tokio::test]
async fn help_and_unknown_commands_reply_locally() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, mut rx) = session_with(Arc::clone(&sink), dir.path());

    session.on_chat_message("C1", ".kernel help").await;
    session.on_chat_message("C2", ".kernel frobnicate").await;

    assert!(drain(&mut rx).is_empty());
    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    for (call, expected) in calls.iter().zip(["C1", "C2"]) {
        let SinkCall::Text { channel, text } = call else {
            panic!("expected text reply, got {call:?}");
        };
        assert_eq!(channel, expected);
        assert!(text.contains(".kernel restart"));
    }
}

#[tokio::test]
async fn channel_set_only_grows() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _rx) = session_with(Arc::new(RecordingSink::default()), dir.path());

    session.on_chat_message("C2", "1").await;
    session.on_chat_message("C1", "2").await;
    session.on_chat_message("C2", "3").await;

    assert_eq!(session.channels().await, vec!["C1".to_owned(), "C2".to_owned()]);
}

#[tokio::test]
async fn ready_status_is_announced() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    session.on_chat_message("C1", "1").await;

    session
        .on_receive(Identity::KernelManager, Envelope::status(Some("ready".into())))
        .await;
    session
        .on_receive(Identity::KernelManager, Envelope::status(Some("dead".into())))
        .await;
    session
        .on_receive(Identity::KernelManager, Envelope::status(Some("serving".into())))
        .await;

    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Text { channel: "C1".into(), text: READY_NOTICE.into() },
            SinkCall::Text { channel: "C1".into(), text: DEAD_NOTICE.into() },
            SinkCall::Text { channel: "C1".into(), text: "Kernel status: serving".into() },
        ]
    );
}

#[tokio::test]
async fn envelopes_not_from_kernel_manager_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    session.on_chat_message("C1", "1").await;

    session
        .on_receive(Identity::FrontEnd, Envelope::message("spoofed"))
        .await;

    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn relayed_output_kinds_are_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    session.on_chat_message("C1", "1").await;

    session
        .on_receive(Identity::KernelManager, Envelope::message("42\n"))
        .await;
    session
        .on_receive(Identity::KernelManager, Envelope::message_raw("Error"))
        .await;
    session
        .on_receive(Identity::KernelManager, Envelope::execute("ignored"))
        .await;

    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Text { channel: "C1".into(), text: "42\n".into() },
            SinkCall::Code { channel: "C1".into(), text: "Error".into() },
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
#[serial_test::serial]
async fn restart_replies_then_starts_manager() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());

    session.on_chat_message("C1", ".kernel restart").await;

    assert_eq!(
        sink.calls().first(),
        Some(&SinkCall::Text { channel: "C1".into(), text: "Restarting kernel...".into() })
    );
    assert!(session.manager().is_running().await);
    session.stop_kernel_manager().await.unwrap();
}
