//! Output events read from the kernel's output channel.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{AppError, Result};

/// MIME type of a plain-text representation.
pub const MIME_TEXT_PLAIN: &str = "text/plain";
/// MIME type of a PNG image representation.
pub const MIME_IMAGE_PNG: &str = "image/png";

/// Rich output keyed by MIME type.
pub type MimeBundle = BTreeMap<String, Value>;

/// One decoded kernel output event.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// Value of the last expression of an execution.
    ExecuteResult {
        /// Representations of the value.
        data: MimeBundle,
    },
    /// Explicit display call (plots, rich reprs).
    DisplayData {
        /// Representations of the displayed object.
        data: MimeBundle,
    },
    /// Text written to stdout or stderr.
    Stream {
        /// Stream name (`stdout`, `stderr`).
        name: String,
        /// Written text.
        text: String,
    },
    /// Uncaught exception.
    Error {
        /// Exception class name.
        ename: String,
        /// Exception message.
        evalue: String,
        /// Formatted traceback lines, possibly ANSI-coloured.
        traceback: Vec<String>,
    },
    /// Busy/idle transitions.
    Status {
        /// Reported execution state.
        execution_state: String,
    },
    /// Any other message type; carried so the caller can log it.
    Other {
        /// Original message type.
        msg_type: String,
    },
}

/// Kernel message as framed on the client connection.
#[derive(Debug, Deserialize)]
pub struct KernelMessage {
    /// Jupyter-style message type.
    pub msg_type: String,
    /// Type-specific content.
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Deserialize)]
struct DataContent {
    #[serde(default)]
    data: MimeBundle,
}

#[derive(Debug, Deserialize)]
struct StreamContent {
    #[serde(default)]
    name: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorContent {
    #[serde(default)]
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusContent {
    execution_state: String,
}

impl KernelEvent {
    /// Decode the content of an output message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` when the content does not match the shape
    /// its `msg_type` requires.
    pub fn from_message(message: KernelMessage) -> Result<Self> {
        let KernelMessage { msg_type, content } = message;
        let malformed =
            |err: serde_json::Error| AppError::Kernel(format!("malformed {msg_type} content: {err}"));

        let event = match msg_type.as_str() {
            "execute_result" => Self::ExecuteResult {
                data: serde_json::from_value::<DataContent>(content).map_err(malformed)?.data,
            },
            "display_data" => Self::DisplayData {
                data: serde_json::from_value::<DataContent>(content).map_err(malformed)?.data,
            },
            "stream" => {
                let stream: StreamContent = serde_json::from_value(content).map_err(malformed)?;
                Self::Stream {
                    name: stream.name,
                    text: stream.text,
                }
            }
            "error" => {
                let error: ErrorContent = serde_json::from_value(content).map_err(malformed)?;
                Self::Error {
                    ename: error.ename,
                    evalue: error.evalue,
                    traceback: error.traceback,
                }
            }
            "status" => Self::Status {
                execution_state: serde_json::from_value::<StatusContent>(content)
                    .map_err(malformed)?
                    .execution_state,
            },
            _ => Self::Other {
                msg_type: msg_type.clone(),
            },
        };
        Ok(event)
    }
}

/// Read a textual MIME entry.
///
/// Kernels send multi-line text either as one string or as a list of
/// lines; both forms are accepted.
///
/// # Errors
///
/// Returns `AppError::Kernel` if the entry is present but not text.
pub fn mime_text(data: &MimeBundle, mime: &str) -> Result<Option<String>> {
    match data.get(mime) {
        None => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| {
                part.as_str()
                    .ok_or_else(|| AppError::Kernel(format!("non-text entry in {mime}")))
            })
            .collect::<Result<String>>()
            .map(Some),
        Some(other) => Err(AppError::Kernel(format!(
            "unexpected {mime} representation: {other}"
        ))),
    }
}
