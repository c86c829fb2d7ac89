// src/core/protocol/io.rs

//! Direct frame I/O on an unsplit stream, used during the handshake before
//! a connection has its receiver and broadcaster attached. Reads consume
//! exactly one frame, so bytes a pipelining client sends early stay in the
//! socket buffer for the receiver.

use crate::core::RelayError;
use crate::core::protocol::{Frame, HEADER_LEN, MAX_PAYLOAD_LEN};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one complete frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<Frame, RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let mut header = &header[..];
    let ty = header.get_u32_le();
    let source_uid = header.get_u32_le();
    let stream_id = header.get_u32_le();
    let size = header.get_u32_le() as usize;
    if size > MAX_PAYLOAD_LEN {
        return Err(RelayError::FrameTooLarge(size));
    }
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).await?;
    Ok(Frame {
        ty,
        source_uid,
        stream_id,
        payload: Bytes::from(payload),
    })
}

/// Writes one complete frame and flushes it.
pub async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), RelayError>
where
    S: AsyncWrite + Unpin,
{
    let encoded = frame.encode_to_vec()?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}
