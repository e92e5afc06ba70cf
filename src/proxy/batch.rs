//! Batched responses, flushed with one scatter-gather write per batch.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::constant::{FRAME_HEADER_SIZE, MAX_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::protocol::frame::FrameHeader;

/// One reply: a pre-encoded header plus its body buffer. The body keeps
/// whatever allocation produced it (synthesized or raw backend bytes) alive
/// until the write completes, then drops it.
pub struct Response {
    header: [u8; FRAME_HEADER_SIZE],
    body: Bytes,
}

impl Response {
    pub fn new(stream: i16, opcode: u8, body: Bytes) -> Self {
        Self {
            header: FrameHeader::response(stream, opcode, body.len() as i32).encode(),
            body,
        }
    }
}

pub struct Batch {
    responses: Vec<Response>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.responses.len() >= MAX_BATCH_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn push(&mut self, response: Response) {
        self.responses.push(response);
    }

    /// Two slices per response: header, then body. Zero-length bodies still
    /// get a slice; vectored writes skip empty buffers for free.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.responses.len() * 2);
        for response in &self.responses {
            slices.push(IoSlice::new(&response.header));
            slices.push(IoSlice::new(&response.body));
        }
        slices
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Write every slice, advancing through partial writes.
pub async fn write_all_vectored<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bufs: &mut [IoSlice<'_>],
) -> Result<()> {
    let mut index = 0;
    while index < bufs.len() {
        // Skip buffers that are already empty.
        if bufs[index].is_empty() {
            index += 1;
            continue;
        }
        match writer.write_vectored(&bufs[index..]).await {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole batch",
                )));
            }
            Ok(mut written) => {
                while written > 0 && index < bufs.len() {
                    let len = bufs[index].len();
                    if written >= len {
                        written -= len;
                        index += 1;
                    } else {
                        bufs[index].advance(written);
                        written = 0;
                    }
                }
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}
