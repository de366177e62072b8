//! Wire codec for relay frames and protocol envelopes.
//!
//! Frames are newline-delimited JSON. [`LineCodec`] wraps
//! [`tokio_util::codec::LinesCodec`] with a fixed maximum line length so a
//! misbehaving peer cannot make the reader allocate without bound; the
//! same framing is used on the kernel client connection.
//!
//! ```json
//! {"frame":"hello","from":"kernel_manager"}
//! {"frame":"message","from":"kernel_manager","to":"main","ttl":600,"payload":{"type":"message","value":"42\n"}}
//! ```

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::models::envelope::Envelope;
use crate::{AppError, Result};

/// Maximum accepted line length: 16 MiB (plots travel inline as base64).
pub const MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Newline-delimited UTF-8 codec with a line-length ceiling.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Codec(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Transport-level frame.
///
/// Identities travel as raw tokens so that a frame from an unknown sender
/// still decodes and can be dropped by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Sent by each side right after a connection is established.
    Hello {
        /// Sender identity token.
        from: String,
    },
    /// Envelope addressed to one participant.
    Message {
        /// Sender identity token.
        from: String,
        /// Recipient identity token.
        to: String,
        /// Seconds the transport may buffer the frame.
        ttl: u64,
        /// The carried envelope.
        payload: Envelope,
    },
}

impl Frame {
    /// Serialize into one line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` for malformed JSON, unknown envelope kinds,
    /// or envelopes missing a required value.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|err| AppError::Codec(format!("malformed frame: {err}")))
    }
}

/// Encode an envelope to its JSON wire bytes.
///
/// # Errors
///
/// Returns `AppError::Codec` if serialization fails.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode an envelope from JSON wire bytes.
///
/// # Errors
///
/// Returns `AppError::Codec` if the bytes are not a valid envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes)
        .map_err(|err| AppError::Codec(format!("malformed envelope: {err}")))
}
