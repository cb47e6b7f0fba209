//! Line framing shared by the peer protocol and stream headers.
//!
//! Frames are newline-terminated. Lines are read one byte at a time so
//! that nothing past the terminator is consumed: after a handshake line
//! the same connection carries raw stream bytes.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a JSON frame on the peer protocol.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Read one `\n`-terminated UTF-8 line, without the terminator.
///
/// Returns `Ok(None)` on a clean EOF before the first byte.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && buf.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if byte == b'\n' {
            break;
        }
        if buf.len() >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {limit} bytes"),
            ));
        }
        buf.push(byte);
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write `line` followed by `\n` and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if line.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line must not contain a newline",
        ));
    }
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one JSON frame. `Ok(None)` on clean EOF.
pub async fn read_json<T, R>(reader: &mut R, limit: usize) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    match read_line(reader, limit).await? {
        Some(line) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

/// Write one JSON frame.
pub async fn write_json<T, W>(writer: &mut W, value: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = serde_json::to_string(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_line(writer, &line).await
}
