//! Protocol envelope exchanged between the two relay participants.
//!
//! On the wire an envelope is a JSON object `{"type": .., "value": ..}`.
//! `value` is omitted for value-less pings (`flush`, bare `status`). The
//! time-to-live travels in the transport frame, not in the envelope body.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Default time an undelivered envelope may wait in the relay outbox.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Code to run in the kernel (front-end → kernel-manager).
    Execute,
    /// Request an immediate output drain (front-end → kernel-manager).
    Flush,
    /// Lifecycle notice or ping (either direction).
    Status,
    /// Plain chat text (kernel-manager → front-end).
    Message,
    /// Preformatted text rendered as a code block.
    MessageRaw,
    /// Base64-encoded PNG bytes.
    Image,
}

impl EnvelopeKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Flush => "flush",
            Self::Status => "status",
            Self::Message => "message",
            Self::MessageRaw => "message_raw",
            Self::Image => "image",
        }
    }
}

/// Immutable tagged unit carried by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub struct Envelope {
    kind: EnvelopeKind,
    value: Option<String>,
    ttl: Duration,
}

impl Envelope {
    /// Build an envelope with the default ttl.
    #[must_use]
    pub fn new(kind: EnvelopeKind, value: Option<String>) -> Self {
        Self {
            kind,
            value,
            ttl: DEFAULT_TTL,
        }
    }

    /// `execute` carrying code for the kernel.
    #[must_use]
    pub fn execute(code: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Execute, Some(code.into()))
    }

    /// Value-less `flush` ping.
    #[must_use]
    pub fn flush() -> Self {
        Self::new(EnvelopeKind::Flush, None)
    }

    /// `status` notice; `None` makes it a ping.
    #[must_use]
    pub fn status(value: Option<String>) -> Self {
        Self::new(EnvelopeKind::Status, value)
    }

    /// Plain `message`.
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Message, Some(text.into()))
    }

    /// `message_raw`, rendered as a code block.
    #[must_use]
    pub fn message_raw(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::MessageRaw, Some(text.into()))
    }

    /// `image` carrying base64 PNG bytes.
    #[must_use]
    pub fn image(base64_png: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Image, Some(base64_png.into()))
    }

    /// Copy of this envelope with a different ttl.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    /// Payload, if any.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// How long the transport may buffer this envelope.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Serialized shape of [`Envelope`].
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        Self {
            kind: envelope.kind,
            value: envelope.value,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = AppError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let needs_value = matches!(
            wire.kind,
            EnvelopeKind::Execute
                | EnvelopeKind::Message
                | EnvelopeKind::MessageRaw
                | EnvelopeKind::Image
        );
        if needs_value && wire.value.is_none() {
            return Err(AppError::Codec(format!(
                "envelope of type {} requires a value",
                wire.kind.as_str()
            )));
        }
        Ok(Self::new(wire.kind, wire.value))
    }
}

/// `status` value sent once the kernel answers.
pub const STATUS_READY: &str = "ready";
/// `status` value sent when the kernel exits unexpectedly.
pub const STATUS_DEAD: &str = "dead";
