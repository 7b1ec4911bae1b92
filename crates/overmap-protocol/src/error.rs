//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding wire frames.
///
/// A `Decode` error is the normal fate of a malformed or unknown inbound
/// frame; the connection handler answers it with an `error` frame and
/// keeps the channel open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a frame into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, a missing required field,
    /// or an unknown `type` tag.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}
