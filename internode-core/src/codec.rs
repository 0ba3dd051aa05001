//! Pluggable payload serialization.
//!
//! The [`MessageCodec`] trait lets deployments bring their own wire format
//! (bincode, protobuf, messagepack, ...) while the crate provides a default
//! [`JsonCodec`]. Verb payload schemas live with the subsystems that own
//! them (gossip, streaming, schema); the messaging layer only ever sees
//! serde values on one side and opaque bytes on the other.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable message serialization format.
///
/// Requires `Clone + 'static` so codec instances can be captured by
/// registered handlers and shared with the transport.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable, handy for debugging; swap in a binary codec for
/// production traffic volume.
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Probe {
        generation: u64,
        heartbeat: u64,
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let msg = Probe {
            generation: 3,
            heartbeat: 17,
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: Probe = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_unit_payload() {
        let codec = JsonCodec;
        let bytes = codec.encode(&()).expect("encode should succeed");
        codec.decode::<()>(&bytes).expect("decode should succeed");
    }

    #[test]
    fn test_json_decode_error() {
        let codec = JsonCodec;
        let result: Result<Probe, CodecError> = codec.decode(b"not json {");
        let err = result.err().expect("should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }
}
