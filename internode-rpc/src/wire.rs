//! Wire format for frame serialization.
//!
//! Frame layout: `[length:4][checksum:4][kind:1][flags:1][verb:4][seq:8][payload]`
//!
//! - **length**: total frame size including the header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **kind**: frame kind discriminant ([`FrameKind`])
//! - **flags**: bit 0 set when the payload is LZ4-compressed
//! - **verb**: verb encoding for Request/OneWay frames, zero otherwise
//! - **seq**: correlation number for request/response pairing; probe id
//!   for Ping/Pong; zero for Hello/HelloAck
//! - **payload**: opaque application bytes

/// Header size: 4 (length) + 4 (checksum) + 1 (kind) + 1 (flags)
/// + 4 (verb) + 8 (seq) = 22 bytes.
pub const HEADER_SIZE: usize = 22;

/// Maximum payload size (4 MiB).
///
/// Frames larger than this are rejected outright; tighter, memory-aware
/// admission happens in the server against its resource limits.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Payload flag: compressed with the negotiated algorithm.
pub const FLAG_COMPRESSED: u8 = 1;

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Checksum verification failed - the frame was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum of the received bytes.
        actual: u32,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Frame kind discriminant is unknown.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// The unknown discriminant.
        kind: u8,
    },

    /// Compressed payload could not be decompressed.
    #[error("decompression failed: {message}")]
    Decompression {
        /// Details of the failure.
        message: String,
    },
}

/// Kind of one wire frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Connection-level negotiation offer (payload: supported algorithms
    /// mask).
    Hello = 0,
    /// Negotiation answer (payload: chosen algorithm mask, zero for none).
    HelloAck = 1,
    /// Request expecting a reply correlated by `seq`.
    Request = 2,
    /// Fire-and-forget message.
    OneWay = 3,
    /// Successful reply to the request with the same `seq`.
    Response = 4,
    /// Error reply; payload is a UTF-8 description.
    Error = 5,
    /// Keepalive probe.
    Ping = 6,
    /// Keepalive probe answer.
    Pong = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(FrameKind::Hello),
            1 => Ok(FrameKind::HelloAck),
            2 => Ok(FrameKind::Request),
            3 => Ok(FrameKind::OneWay),
            4 => Ok(FrameKind::Response),
            5 => Ok(FrameKind::Error),
            6 => Ok(FrameKind::Ping),
            7 => Ok(FrameKind::Pong),
            kind => Err(WireError::UnknownKind { kind }),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload flags (compression).
    pub flags: u8,
    /// Verb encoding; meaningful for Request/OneWay.
    pub verb: u32,
    /// Correlation / probe number.
    pub seq: u64,
    /// Opaque payload bytes (already decompressed on the decode side).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with no flags set.
    pub fn new(kind: FrameKind, verb: u32, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            flags: 0,
            verb,
            seq,
            payload,
        }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // checksum patched below
        buf.push(self.kind as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&self.verb.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.payload);

        let checksum = crc32c::crc32c(&buf[8..]);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decode the body of a frame whose length prefix has already been
    /// consumed.
    ///
    /// `body` is everything after the length field: checksum, kind, flags,
    /// verb, seq and payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on checksum mismatch, short input or an
    /// unknown kind discriminant.
    pub fn decode_body(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < HEADER_SIZE - 4 {
            return Err(WireError::InvalidLength {
                length: (body.len() + 4) as u32,
            });
        }
        let expected = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let actual = crc32c::crc32c(&body[4..]);
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let kind = FrameKind::try_from(body[4])?;
        let flags = body[5];
        let verb = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
        let seq = u64::from_le_bytes([
            body[10], body[11], body[12], body[13], body[14], body[15], body[16], body[17],
        ]);
        let payload = body[18..].to_vec();

        Ok(Self {
            kind,
            flags,
            verb,
            seq,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let encoded = frame.encode();
        let length = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len());
        Frame::decode_body(&encoded[4..]).expect("decode should succeed")
    }

    #[test]
    fn test_request_roundtrip() {
        let frame = Frame::new(FrameKind::Request, 6, 42, b"digest".to_vec());
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let frame = Frame::new(FrameKind::Ping, 0, 7, Vec::new());
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.kind, FrameKind::Ping);
        assert_eq!(decoded.seq, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let mut encoded = Frame::new(FrameKind::Response, 0, 9, b"value".to_vec()).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = Frame::decode_body(&encoded[4..]).err().expect("must fail");
        assert!(matches!(err, WireError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut encoded = Frame::new(FrameKind::Pong, 0, 1, Vec::new()).encode();
        encoded[8] = 99;
        // fix up the checksum so only the kind is wrong
        let checksum = crc32c::crc32c(&encoded[8..]);
        encoded[4..8].copy_from_slice(&checksum.to_le_bytes());
        let err = Frame::decode_body(&encoded[4..]).err().expect("must fail");
        assert!(matches!(err, WireError::UnknownKind { kind: 99 }));
    }

    #[test]
    fn test_short_body_rejected() {
        let err = Frame::decode_body(&[0u8; 4]).err().expect("must fail");
        assert!(matches!(err, WireError::InvalidLength { .. }));
    }

    #[test]
    fn test_kind_discriminants_stable() {
        for kind in [
            FrameKind::Hello,
            FrameKind::HelloAck,
            FrameKind::Request,
            FrameKind::OneWay,
            FrameKind::Response,
            FrameKind::Error,
            FrameKind::Ping,
            FrameKind::Pong,
        ] {
            assert_eq!(FrameKind::try_from(kind as u8).expect("roundtrip"), kind);
        }
    }
}
