//! Framed I/O over a generic async byte stream.
//!
//! Both ends of a connection use the same two helpers: [`write_frame`]
//! applies compression and pushes one frame, [`read_frame`] pulls one
//! frame and transparently decompresses it. Streams are boxed so a
//! connection can be plain TCP or TLS behind the same type.

use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compress::Compressor;
use crate::wire::{FLAG_COMPRESSED, Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError};

/// Byte stream a connection runs over (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin {}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncStream for S {}

/// A boxed connection stream.
pub type BoxedStream = Box<dyn AsyncStream>;

fn frame_carries_payload(kind: FrameKind) -> bool {
    matches!(
        kind,
        FrameKind::Request | FrameKind::OneWay | FrameKind::Response
    )
}

/// Write one frame, compressing its payload when a compressor is
/// negotiated and the frame kind carries application payload.
///
/// Returns the number of bytes written to the wire.
///
/// # Errors
///
/// Propagates I/O errors from the underlying stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mut frame: Frame,
    compressor: Option<&Rc<dyn Compressor>>,
) -> std::io::Result<usize> {
    if let Some(compressor) = compressor {
        if frame_carries_payload(frame.kind) && !frame.payload.is_empty() {
            frame.payload = compressor.compress(&frame.payload);
            frame.flags |= FLAG_COMPRESSED;
        }
    }
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(encoded.len())
}

/// Read one frame; returns `Ok(None)` on clean end-of-stream.
///
/// The second element of the pair is the number of wire bytes consumed.
///
/// # Errors
///
/// I/O errors from the stream; corrupt frames (bad checksum, oversized
/// length, failed decompression) surface as
/// [`std::io::ErrorKind::InvalidData`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    compressor: Option<&Rc<dyn Compressor>>,
) -> std::io::Result<Option<(Frame, usize)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = u32::from_le_bytes(len_buf) as usize;
    if length < HEADER_SIZE || length > HEADER_SIZE + MAX_PAYLOAD_SIZE {
        return Err(invalid_data(WireError::InvalidLength {
            length: length as u32,
        }));
    }

    let mut body = vec![0u8; length - 4];
    reader.read_exact(&mut body).await?;

    let mut frame = Frame::decode_body(&body).map_err(invalid_data)?;
    if frame.flags & FLAG_COMPRESSED != 0 {
        let Some(compressor) = compressor else {
            return Err(invalid_data(WireError::Decompression {
                message: "compressed frame without negotiated algorithm".to_string(),
            }));
        };
        frame.payload = compressor.decompress(&frame.payload).map_err(invalid_data)?;
        frame.flags &= !FLAG_COMPRESSED;
    }

    Ok(Some((frame, length)))
}

fn invalid_data(err: WireError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}
