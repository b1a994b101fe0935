//! Length-prefixed multipart framing
//!
//! One message on the wire is:
//!
//! ```text
//! u32 frame-count | (u32 length | bytes) * frame-count
//! ```
//!
//! All integers big-endian. Hard caps keep a misbehaving peer from
//! ballooning memory: at most [`MAX_FRAMES`] frames per message and
//! [`MAX_FRAME_LEN`] bytes per frame.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::FabricError;

/// Maximum frames in one message.
pub const MAX_FRAMES: u32 = 16;

/// Maximum bytes in one frame (64 MiB - comfortably above any chunk size).
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Writes one multipart message.
pub async fn write_frames<W>(writer: &mut W, frames: &[&[u8]]) -> Result<(), FabricError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(frames.len() <= MAX_FRAMES as usize);

    writer.write_u32(frames.len() as u32).await?;
    for frame in frames {
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one multipart message.
///
/// Returns `Ok(None)` on a clean EOF before the first byte (peer closed
/// between messages); a mid-message EOF is an error.
pub async fn read_frames<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>, FabricError>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if count == 0 || count > MAX_FRAMES {
        return Err(FabricError::Protocol(format!(
            "invalid frame count {count} (max {MAX_FRAMES})"
        )));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(FabricError::Protocol(format!(
                "frame of {len} bytes exceeds cap {MAX_FRAME_LEN}"
            )));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}
