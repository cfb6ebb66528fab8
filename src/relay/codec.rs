//! Response Channel Framing
//!
//! Frame layout: a 4-byte big-endian length followed by that many bytes of
//! MessagePack encoding one [`ResponseEnvelope`]. A connection carries any
//! number of frames; clean EOF between frames ends it.

use bytes::{BufMut, BytesMut};
use rmp_serde::{from_slice, to_vec_named};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::envelope::ResponseEnvelope;
use crate::error::{RelayError, Result};

/// Size of the length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default upper bound for a frame body (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode one envelope as a length-prefixed frame
pub fn encode_frame(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    let body = to_vec_named(envelope).map_err(|e| RelayError::Serialization(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| RelayError::Frame(format!("frame of {} bytes too large", body.len())))?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.put_u32(len);
    frame.put_slice(&body);
    Ok(frame.to_vec())
}

/// Decode a frame body
pub fn decode_body(body: &[u8]) -> Result<ResponseEnvelope> {
    from_slice(body).map_err(|e| RelayError::Frame(format!("undecodable envelope: {}", e)))
}

/// Read the next envelope from `reader`
///
/// Returns `Ok(None)` on clean EOF before a frame starts.
///
/// # Errors
///
/// [`RelayError::Frame`] for zero-length or oversized frames, EOF inside a
/// frame, or an undecodable body; [`RelayError::Network`] for I/O failures.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<ResponseEnvelope>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RelayError::Frame("connection closed inside frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(RelayError::Frame("zero-length frame".into()));
    }
    if len > max_frame_size {
        return Err(RelayError::Frame(format!(
            "frame size {} exceeds maximum {} bytes",
            len, max_frame_size
        )));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RelayError::Frame("connection closed inside frame body".into()));
        }
        Err(e) => return Err(e.into()),
    }

    decode_body(&body).map(Some)
}

/// Write one envelope to `writer`
pub async fn write_frame<W>(writer: &mut W, envelope: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::envelope::new_correlation_id;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_multiple_frames_then_eof() {
        let first = ResponseEnvelope::success(new_correlation_id(), 200, b"a".to_vec());
        let second = ResponseEnvelope::failure(new_correlation_id(), Some(500), "boom");

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());
        let mut reader = Cursor::new(bytes);

        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap(), None);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let envelope = ResponseEnvelope::success(new_correlation_id(), 200, Vec::new());
        let frame = encode_frame(&envelope).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let mut reader = Cursor::new(vec![0u8, 0, 0, 0]);
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, RelayError::Frame(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut reader = Cursor::new(vec![0u8, 0, 0x10, 0]);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        let envelope = ResponseEnvelope::success(new_correlation_id(), 200, b"body".to_vec());
        let mut frame = encode_frame(&envelope).unwrap();
        frame.truncate(frame.len() - 2);
        let mut reader = Cursor::new(frame);
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, RelayError::Frame(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_rejected() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        let mut reader = Cursor::new(bytes);
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, RelayError::Frame(_)));
    }
}
