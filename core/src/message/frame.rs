//! Frame: length-prefixed transport framing for envelopes
//!
//! [4] body length (BE u32), excluding the length field itself
//! [N] envelope body (see `codec.rs`)
//!
//! A frame that fails to decode is consumed in full, so the stream stays
//! aligned on the next frame and the connection can keep going.

use super::codec::{decode_envelope, encode_into, encoded_len};
use super::{Envelope, WireError};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame body: 16 MiB
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Outcome of reading one frame off a healthy stream
#[derive(Debug)]
pub enum FrameRead {
    /// A well-formed envelope
    Envelope(Envelope),
    /// The frame was consumed but could not be decoded
    Malformed(WireError),
}

/// Encode `envelope` as a complete frame (length prefix included).
///
/// Bodies longer than `max_frame_len` are refused, since a reader with the
/// same limit would discard them.
pub fn encode_frame(envelope: &Envelope, max_frame_len: usize) -> Result<Vec<u8>, WireError> {
    let body_len = encoded_len(envelope);
    let max = max_frame_len.min(u32::MAX as usize);
    if body_len > max {
        return Err(WireError::FrameTooLarge { len: body_len, max });
    }
    let prefix = body_len as u32;

    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&prefix.to_be_bytes());
    encode_into(envelope, &mut buf)?;
    Ok(buf)
}

/// Write one envelope as a single frame and flush, using
/// [`DEFAULT_MAX_FRAME_LEN`] as the body limit.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<usize, FrameWriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame_limited(writer, envelope, DEFAULT_MAX_FRAME_LEN).await
}

/// Write one envelope as a single frame and flush.
///
/// Encoding happens before anything touches the stream, so an encode error
/// (including a body over `max_frame_len`) never leaves a partial frame behind.
pub async fn write_frame_limited<W>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame_len: usize,
) -> Result<usize, FrameWriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(envelope, max_frame_len).map_err(FrameWriteError::Encode)?;
    writer.write_all(&frame).await.map_err(FrameWriteError::Io)?;
    writer.flush().await.map_err(FrameWriteError::Io)?;
    Ok(frame.len())
}

/// Why a frame could not be written
#[derive(Debug, thiserror::Error)]
pub enum FrameWriteError {
    /// The envelope cannot be represented on the wire; the stream is untouched
    #[error(transparent)]
    Encode(WireError),
    /// The stream failed
    #[error(transparent)]
    Io(io::Error),
}

/// Read one frame.
///
/// I/O errors (including a clean close by the peer) are returned as `Err`;
/// the stream is unusable afterwards. Frames that are empty, oversized or
/// undecodable come back as `Ok(FrameRead::Malformed)`.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> io::Result<FrameRead>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await? as usize;

    if len == 0 {
        return Ok(FrameRead::Malformed(WireError::EmptyFrame));
    }

    if len > max_frame_len {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside oversized frame",
            ));
        }
        return Ok(FrameRead::Malformed(WireError::FrameTooLarge {
            len,
            max: max_frame_len,
        }));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(match decode_envelope(&body) {
        Ok(envelope) => FrameRead::Envelope(envelope),
        Err(e) => FrameRead::Malformed(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::encode_envelope;

    fn envelope(id: &str) -> Envelope {
        Envelope::builder(id, "g").payload(vec![1, 2, 3]).build()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let written = write_frame(&mut client, &envelope("1")).await.unwrap();
        assert_eq!(written, 4 + encoded_len(&envelope("1")));

        match read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            FrameRead::Envelope(e) => assert!(e.same_content(&envelope("1"))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_stream_aligned() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // garbage body with a valid length prefix
        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00]).await.unwrap();
        write_frame(&mut client, &envelope("2")).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap(),
            FrameRead::Malformed(WireError::InvalidVersion(0xde))
        ));
        match read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            FrameRead::Envelope(e) => assert_eq!(e.id(), "2"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let body = encode_envelope(&Envelope::builder("big", "g").payload(vec![7u8; 200]).build()).unwrap();
        client.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();
        write_frame(&mut client, &envelope("small")).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, 64).await.unwrap(),
            FrameRead::Malformed(WireError::FrameTooLarge { max: 64, .. })
        ));
        match read_frame(&mut server, 64).await.unwrap() {
            FrameRead::Envelope(e) => assert_eq!(e.id(), "small"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap(),
            FrameRead::Malformed(WireError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_encode_error_writes_nothing() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bad = Envelope::builder("x".repeat(70_000), "g").build();

        assert!(matches!(
            write_frame(&mut client, &bad).await,
            Err(FrameWriteError::Encode(WireError::FieldTooLong { field: "id", .. }))
        ));
        drop(client);
        assert!(read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.is_err());
    }

    #[tokio::test]
    async fn test_body_over_limit_is_refused_before_writing() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let big = Envelope::builder("big", "g").payload(vec![7u8; 200]).build();

        assert!(matches!(
            write_frame_limited(&mut client, &big, 64).await,
            Err(FrameWriteError::Encode(WireError::FrameTooLarge { max: 64, .. }))
        ));
        write_frame_limited(&mut client, &envelope("small"), 64).await.unwrap();

        match read_frame(&mut server, 64).await.unwrap() {
            FrameRead::Envelope(e) => assert_eq!(e.id(), "small"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_frame_accepts_body_at_limit() {
        let e = envelope("edge");
        let body_len = encoded_len(&e);
        assert_eq!(encode_frame(&e, body_len).unwrap().len(), 4 + body_len);
        assert!(encode_frame(&e, body_len - 1).is_err());
    }
}
