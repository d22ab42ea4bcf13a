//! Codec trait and implementations for serializing/deserializing messages.
//!
//! A codec (coder/decoder) turns typed values into bytes and back. The
//! transport only moves byte frames, and the room server only sees typed
//! requests, so the codec is the one place that knows what a frame looks
//! like on the wire.
//!
//! The rest of the stack never names a serialization format. Anything that
//! implements [`Codec`] can sit between the transport's bytes and the typed
//! [`Envelope`](crate::Envelope). The front door is generic over nothing:
//! it holds a [`JsonCodec`] by value, and swapping formats means swapping
//! that one field.
//!
//! ## Why the methods are generic
//!
//! One codec instance encodes outgoing `Envelope<ServerMessage>` values and
//! decodes incoming `Envelope<ClientMessage>` values. Making `encode` and
//! `decode` generic over `T` lets a single value serve both directions
//! instead of needing a codec type per message type.
//!
//! [`JsonCodec`] is only compiled with the `json` feature (on by default),
//! so a build that brings its own format does not pull in `serde_json`.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `decode` returns owned values (`DeserializeOwned`) so the input buffer
/// can be dropped as soon as decoding finishes.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Human-readable and easy to inspect in browser tooling, which suits
/// lobby and room-management traffic. Behind the `json` feature (default).
///
/// ```rust
/// use realm_protocol::{ClientMessage, Codec, Envelope, JsonCodec};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(1, 0, ClientMessage::ExitRoom);
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope<ClientMessage> = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
