//! Fan-out of kernel output to every known channel.

use std::sync::Arc;

use slack_kernel_relay::models::envelope::{Envelope, EnvelopeKind};
use slack_kernel_relay::models::identity::Identity;
use slack_kernel_relay::relay::RelayHandler;

use super::test_helpers::{session_with, RecordingSink, SinkCall};

const PNG_SIGNATURE_B64: &str = "iVBORw0KGgo=";

async fn register(session: &slack_kernel_relay::frontend::FrontendSession, channels: &[&str]) {
    for channel in channels {
        session.on_chat_message(channel, "1").await;
    }
}

fn uploads(calls: &[SinkCall]) -> Vec<&SinkCall> {
    calls
        .iter()
        .filter(|call| matches!(call, SinkCall::Upload { .. }))
        .collect()
}

fn png_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "png"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn message_is_posted_to_every_channel() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1", "C2"]).await;

    session.broadcast("42\n", EnvelopeKind::Message).await;

    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Text { channel: "C1".into(), text: "42\n".into() },
            SinkCall::Text { channel: "C2".into(), text: "42\n".into() },
        ]
    );
}

#[tokio::test]
async fn raw_message_is_posted_as_code_block() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1"]).await;

    session.broadcast("Traceback", EnvelopeKind::MessageRaw).await;

    assert_eq!(
        sink.calls(),
        vec![SinkCall::Code { channel: "C1".into(), text: "Traceback".into() }]
    );
}

#[tokio::test]
async fn failure_on_one_channel_does_not_stop_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::failing());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1", "C2", "C3"]).await;

    session.broadcast("hello", EnvelopeKind::Message).await;

    assert_eq!(sink.calls().len(), 3);
}

#[tokio::test]
async fn image_is_uploaded_once_per_channel_then_removed() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1", "C2", "C3"]).await;

    session.broadcast(PNG_SIGNATURE_B64, EnvelopeKind::Image).await;

    let calls = sink.calls();
    let uploads = uploads(&calls);
    assert_eq!(uploads.len(), 3);
    for call in uploads {
        let SinkCall::Upload { path, existed, .. } = call else { unreachable!() };
        assert!(existed, "file must exist during upload");
        assert!(!path.exists(), "temp file must be gone after broadcast");
        assert_eq!(path.extension().unwrap(), "png");
    }
    assert_eq!(png_files(dir.path()), 0);
}

#[tokio::test]
async fn image_temp_file_is_removed_even_when_every_upload_fails() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::failing());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1", "C2"]).await;

    session.broadcast(PNG_SIGNATURE_B64, EnvelopeKind::Image).await;

    let calls = sink.calls();
    assert_eq!(uploads(&calls).len(), 2);
    assert_eq!(png_files(dir.path()), 0);
}

#[tokio::test]
async fn undecodable_image_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1"]).await;

    session.broadcast("not base64!!", EnvelopeKind::Image).await;

    assert!(uploads(&sink.calls()).is_empty());
    assert_eq!(png_files(dir.path()), 0);
}

#[tokio::test]
async fn nothing_is_posted_without_channels() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());

    session.broadcast("lonely", EnvelopeKind::Message).await;

    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn relayed_image_is_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (session, _rx) = session_with(Arc::clone(&sink), dir.path());
    register(&session, &["C1"]).await;

    session
        .on_receive(Identity::KernelManager, Envelope::image(PNG_SIGNATURE_B64))
        .await;

    assert_eq!(uploads(&sink.calls()).len(), 1);
}
