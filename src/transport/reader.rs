//! Frame-level read side of the channel.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FlowError, Result};
use crate::protocol::{Frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};

const READ_CHUNK: usize = 64 * 1024;

/// Turns a byte stream into whole frames.
///
/// Owned by exactly one task (the dispatcher); there is no shared state.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Box<[u8]>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_payload(reader, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(reader: R, max_payload_size: u32) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_payload(max_payload_size),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// - `Ok(Some(frame))`: a whole frame
    /// - `Ok(None)`: the peer closed the stream on a frame boundary
    /// - `Err(_)`: I/O failure, oversize frame, or EOF inside a frame
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn receive(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.has_partial() {
                    return Err(FlowError::Protocol(format!(
                        "Stream closed with {} bytes of an unfinished frame",
                        self.buffer.len()
                    )));
                }
                return Ok(None);
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }
}
