//! Native messaging framing: every message is a `u32` little-endian byte
//! length followed by that many bytes of UTF-8 JSON, in both directions.
//!
//! The read half is owned by the dispatcher loop. The write half is a
//! cloneable [`MessageSender`] shared with every monitor task; a single
//! mutex is held across length prefix, payload and flush so frames from
//! different tasks never interleave.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Largest frame the browser may send to a native host (64 MiB).
pub const MAX_INCOMING_FRAME: usize = 64 * 1024 * 1024;

/// Largest frame a native host may send to the browser (1 MiB).
pub const MAX_OUTGOING_FRAME: usize = 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Framing errors. All of them end the session.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("I/O error on message channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed after {read} of {expected} expected bytes")]
    Truncated { expected: usize, read: usize },

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read half of the channel.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next message.
    ///
    /// Returns `Ok(None)` when the stream ends before any byte of a new
    /// length prefix arrives. A stream that ends anywhere else is
    /// [`ChannelError::Truncated`].
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ChannelError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let filled = read_full(&mut self.inner, &mut prefix).await?;
        if filled == 0 {
            info!("No length bytes read, end of stream.");
            return Ok(None);
        }
        if filled < LENGTH_PREFIX_SIZE {
            return Err(ChannelError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                read: filled,
            });
        }

        let length = u32::from_le_bytes(prefix) as usize;
        if length > MAX_INCOMING_FRAME {
            return Err(ChannelError::FrameTooLarge {
                size: length,
                limit: MAX_INCOMING_FRAME,
            });
        }

        let mut payload = vec![0u8; length];
        let read = read_full(&mut self.inner, &mut payload).await?;
        if read < length {
            return Err(ChannelError::Truncated {
                expected: length,
                read,
            });
        }

        debug!("Received: {}", String::from_utf8_lossy(&payload));
        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

/// Fills `buf` unless the stream ends first; returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Write half of the channel. Clones share the same underlying writer.
#[derive(Clone)]
pub struct MessageSender {
    writer: SharedWriter,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}

impl MessageSender {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Serializes `message` and writes it as one frame.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_OUTGOING_FRAME {
            return Err(ChannelError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_OUTGOING_FRAME,
            });
        }
        let length = (payload.len() as u32).to_le_bytes();

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&length).await?;
            writer.write_all(&payload).await?;
            writer.flush().await?;
        }

        debug!("Sent: {}", String::from_utf8_lossy(&payload));
        Ok(())
    }
}
