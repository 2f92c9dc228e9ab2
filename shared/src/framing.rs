//! Length-prefixed framing for the reliable stream.
//!
//! ```text
//! +-------------------+--------------------------------+
//! | length (2 bytes)  |   payload (length bytes)       |
//! | u16 little-endian |   tag byte + packet fields     |
//! +-------------------+--------------------------------+
//! ```
//!
//! The prefix does not count itself. Zero-length frames are rejected because
//! every packet carries at least its tag byte.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Limits applied by the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest accepted payload. Defaults to the client receive buffer size.
    pub max_payload_size: u16,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 2046,
        }
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: u16 },

    #[error("empty frame")]
    Empty,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Reads one frame and returns its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;
    let len = u16::from_le_bytes(len_buf);

    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len as usize,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    Ok(payload)
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    writer
        .write_all(&(payload.len() as u16).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
