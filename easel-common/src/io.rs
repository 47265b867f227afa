//! Line-delimited JSON I/O
//!
//! Each protocol message is one JSON object followed by `\n`. Reads are
//! bounded in length and, for unauthenticated connections, in time.

use std::io;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Maximum length of a single line (canvas messages are hex-encoded, so allow a few MiB)
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// How long a connection may stay silent before its first byte of a message
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a message may take to arrive once its first byte was seen
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from reading a message line
#[derive(Debug, Error)]
pub enum LineError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
    #[error("connection idle for too long")]
    IdleTimeout,
    #[error("message took too long to arrive")]
    LineTimeout,
    #[error("invalid message: {0}")]
    InvalidJson(String),
}

impl From<LineError> for io::Error {
    fn from(err: LineError) -> Self {
        match err {
            LineError::Io(e) => e,
            LineError::IdleTimeout | LineError::LineTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, err.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Read one raw line without its terminator
///
/// Returns `Ok(None)` when the stream ends cleanly between lines.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, LineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(LineError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                )));
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if line.len() > max_len {
            return Err(LineError::LineTooLong);
        }
        if done {
            break;
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Read and parse one message, waiting indefinitely for it
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, LineError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let Some(line) = read_line(reader, MAX_LINE_LENGTH).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&line)
        .map(Some)
        .map_err(|e| LineError::InvalidJson(e.to_string()))
}

/// Read one message with both an idle timeout and a per-message timeout
///
/// Used before login, where a silent connection only holds resources.
pub async fn read_message_with_full_timeout<R, T>(
    reader: &mut R,
    idle_timeout: Duration,
    line_timeout: Duration,
) -> Result<Option<T>, LineError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match timeout(idle_timeout, reader.fill_buf()).await {
        Err(_) => return Err(LineError::IdleTimeout),
        Ok(result) => {
            result?;
        }
    }

    timeout(line_timeout, read_message(reader))
        .await
        .map_err(|_| LineError::LineTimeout)?
}

/// Serialize and send one message
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload =
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await
}
