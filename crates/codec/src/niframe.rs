//! 4-byte big-endian length-prefixed message framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{DEFAULT_MAX_FRAME, Error};

/// Reads the 4-byte frame header and returns the payload length it
/// announces, rejecting announcements above `max_frame`.
pub fn frame_len(header: &[u8; 4], max_frame: usize) -> Result<usize, Error> {
    let len = u32::from_be_bytes(*header) as usize;
    if len > max_frame {
        return Err(Error::FrameTooLarge { len, max: max_frame });
    }
    Ok(len)
}

/// Reads one NI-framed message from `stream`. Returns `Ok(None)` on a clean
/// EOF at a frame boundary (no bytes read at all); a short read mid-frame is
/// `Err(Error::Truncated)`, matching the spec's "EOF mid-frame is a protocol
/// error" rule.
pub async fn read_frame<R>(stream: &mut R, max_frame: usize) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let n = read_fill(stream, &mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < 4 {
        return Err(Error::Truncated);
    }

    let len = frame_len(&header, max_frame)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let n = read_fill(stream, &mut payload).await?;
        if n < len {
            return Err(Error::Truncated);
        }
    }
    Ok(Some(payload))
}

/// Writes one NI-framed message: a 4-byte big-endian length prefix followed
/// by `payload`.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Like `write_frame` but with the default max-frame limit applied for
/// symmetry with `read_frame` at call sites that don't carry a configured
/// limit.
pub async fn write_frame_default<W>(stream: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= DEFAULT_MAX_FRAME);
    write_frame(stream, payload).await
}

async fn read_fill<R>(stream: &mut R, buf: &mut [u8]) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|_| Error::Truncated)?;
        if n == 0 {
            return Ok(filled);
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor, DEFAULT_MAX_FRAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn clean_eof_at_boundary() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let got = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn truncated_mid_frame_is_error() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 10, 1, 2, 3]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut cursor = std::io::Cursor::new(vec![0xFFu8, 0xFF, 0xFF, 0xFF]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
