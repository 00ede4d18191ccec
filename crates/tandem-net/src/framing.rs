//! Length-prefixed framing for TCP streams.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   body             |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length counts only the body, never the 4 prefix bytes. The first body
//! byte is the message tag (see [`crate::messages`]).
//!
//! No size cap is applied unless [`FrameConfig::max_body_size`] is set; an
//! asset attachment can legitimately be tens of megabytes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    /// Maximum allowed body size in bytes. `None` accepts any `u32` length.
    pub max_body_size: Option<u32>,
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body size exceeds the configured maximum.
    #[error("frame body size {size} exceeds maximum {max}")]
    BodyTooLarge {
        /// The declared body size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The declared length does not match the bytes actually present.
    #[error("frame declares {declared} body bytes but {available} are present")]
    LengthMismatch {
        /// Length from the prefix.
        declared: u32,
        /// Bytes following the prefix.
        available: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn check_size(size: u32, config: &FrameConfig) -> Result<(), FrameError> {
    match config.max_body_size {
        Some(max) if size > max => Err(FrameError::BodyTooLarge { size, max }),
        _ => Ok(()),
    }
}

/// Prefix `body` with its little-endian `u32` length.
pub fn frame_body(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Split a complete in-memory frame into its body.
///
/// Fails with [`FrameError::LengthMismatch`] unless the declared length equals
/// the number of bytes after the prefix exactly.
pub fn split_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::LengthMismatch {
            declared: 0,
            available: frame.len(),
        });
    }
    let (prefix, body) = frame.split_at(LENGTH_PREFIX_SIZE);
    let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if declared as usize != body.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            available: body.len(),
        });
    }
    Ok(body)
}

/// Read a single length-prefixed frame from the stream.
///
/// Returns the body bytes. Blocks until the full frame is available.
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let body_len = u32::from_le_bytes(len_buf);
    check_size(body_len, config)?;

    let mut body = vec![0u8; body_len as usize];
    if body_len > 0 {
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(body)
}

/// Write a single length-prefixed frame to the stream and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    body: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = body.len() as u32;
    check_size(len, config)?;

    writer.write_all(&len.to_le_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await?;

    Ok(())
}
