//! Length-prefixed binary framing for the device TCP protocol.
//!
//! Wire format: `big_endian_u32(len) || bincode(message)[len]`. Both sides
//! reject empty frames and frames past [`MAX_FRAME_LEN`] by dropping the
//! connection.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload, in bytes.
pub const MAX_FRAME_LEN: usize = 65_536;

/// Errors raised while reading or writing framed messages.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A zero-length frame; the protocol never produces one.
    #[error("zero-length frame")]
    Empty,
    /// A frame longer than [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(usize),
    /// The payload could not be serialized or deserialized.
    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error is the peer closing the connection between frames.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Reads one length-prefixed frame and returns its payload bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and deserializes its payload.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Serializes a message and writes it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    write_frame(writer, &payload).await
}
