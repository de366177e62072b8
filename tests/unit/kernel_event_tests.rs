//! Decoding of kernel output messages.

use serde_json::json;
use slack_kernel_relay::models::kernel_event::{
    mime_text, KernelEvent, KernelMessage, MimeBundle, MIME_TEXT_PLAIN,
};
use slack_kernel_relay::AppError;

fn message(value: serde_json::Value) -> KernelMessage {
    serde_json::from_value(value).unwrap()
}

#[test]
fn stream_message_decodes() {
    let event = KernelEvent::from_message(message(json!({
        "msg_type": "stream",
        "content": {"name": "stdout", "text": "42\n"}
    })))
    .unwrap();
    assert_eq!(
        event,
        KernelEvent::Stream {
            name: "stdout".into(),
            text: "42\n".into()
        }
    );
}

#[test]
fn error_message_keeps_traceback_lines() {
    let event = KernelEvent::from_message(message(json!({
        "msg_type": "error",
        "content": {"ename": "ZeroDivisionError", "evalue": "division by zero",
                    "traceback": ["line one", "line two"]}
    })))
    .unwrap();
    match event {
        KernelEvent::Error { ename, traceback, .. } => {
            assert_eq!(ename, "ZeroDivisionError");
            assert_eq!(traceback, vec!["line one", "line two"]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn unknown_message_types_are_other() {
    let event = KernelEvent::from_message(message(json!({
        "msg_type": "execute_input",
        "content": {"code": "1"}
    })))
    .unwrap();
    assert_eq!(
        event,
        KernelEvent::Other {
            msg_type: "execute_input".into()
        }
    );
}

#[test]
fn stream_without_text_is_malformed() {
    let err = KernelEvent::from_message(message(json!({
        "msg_type": "stream",
        "content": {"name": "stdout"}
    })))
    .unwrap_err();
    assert!(matches!(err, AppError::Kernel(_)));
}

#[test]
fn mime_text_joins_string_arrays() {
    let mut data = MimeBundle::new();
    data.insert(MIME_TEXT_PLAIN.into(), json!(["a", "b\n", "c"]));
    assert_eq!(mime_text(&data, MIME_TEXT_PLAIN).unwrap().as_deref(), Some("ab\nc"));
}

#[test]
fn mime_text_absent_is_none() {
    assert_eq!(mime_text(&MimeBundle::new(), MIME_TEXT_PLAIN).unwrap(), None);
}

#[test]
fn mime_text_rejects_objects() {
    let mut data = MimeBundle::new();
    data.insert(MIME_TEXT_PLAIN.into(), json!({"nested": true}));
    assert!(matches!(mime_text(&data, MIME_TEXT_PLAIN), Err(AppError::Kernel(_))));
}
