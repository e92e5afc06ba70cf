//! Frame header layout and the incremental frame decoder.

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::{FRAME_HEADER_SIZE, RESPONSE_VERSION};
use crate::error::Result;

/// CQL frame header (zero-copy)
///
/// Layout matches the native protocol:
/// - version: 1 byte (direction bit 0x80)
/// - flags: 1 byte
/// - stream: 2 bytes (big-endian, signed)
/// - opcode: 1 byte
/// - length: 4 bytes (big-endian, signed, body byte count)
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    stream: I16BE,
    pub opcode: u8,
    length: I32BE,
}

impl FrameHeader {
    pub fn new(version: u8, flags: u8, stream: i16, opcode: u8, length: i32) -> Self {
        Self {
            version,
            flags,
            stream: I16BE::new(stream),
            opcode,
            length: I32BE::new(length),
        }
    }

    /// Header for an outbound reply: always v4, no flags.
    pub fn response(stream: i16, opcode: u8, length: i32) -> Self {
        Self::new(RESPONSE_VERSION, 0, stream, opcode, length)
    }

    pub fn stream(&self) -> i16 {
        self.stream.get()
    }

    pub fn length(&self) -> i32 {
        self.length.get()
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Decoded header fields handed to the sink before any body bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
    pub length: i32,
}

/// Consumer of decoder events.
///
/// `header_done` fires once the length field is complete, before any body
/// byte arrives, so the consumer decides where the body will be copied.
/// `body_chunk` fires zero or more times; the chunk lengths sum to the
/// declared body length. `body_done` fires after the last body byte; for a
/// zero-length body it directly follows `header_done`.
pub trait FrameSink {
    fn header_done(&mut self, header: &FrameInfo) -> Result<()>;
    fn body_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    fn body_done(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Version,
    Flags,
    Stream,
    Opcode,
    Length,
    Body,
}

/// Byte-by-byte frame reassembler. Accepts arbitrary fragmentation: a frame
/// may arrive in any number of chunks and a chunk may span frames.
pub struct FrameDecoder {
    state: DecodeState,
    header: FrameInfo,
    accum: u32,
    remaining: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Version,
            header: FrameInfo::default(),
            accum: 0,
            remaining: 0,
        }
    }

    /// Feed a chunk of the byte stream, emitting sink events for every
    /// complete header and body encountered.
    pub fn decode<S: FrameSink>(&mut self, mut data: &[u8], sink: &mut S) -> Result<()> {
        while !data.is_empty() {
            match self.state {
                DecodeState::Version => {
                    self.header = FrameInfo {
                        version: data[0],
                        ..FrameInfo::default()
                    };
                    self.state = DecodeState::Flags;
                    data = &data[1..];
                }
                DecodeState::Flags => {
                    self.header.flags = data[0];
                    self.accum = 0;
                    self.remaining = 2;
                    self.state = DecodeState::Stream;
                    data = &data[1..];
                }
                DecodeState::Stream => {
                    while !data.is_empty() && self.remaining > 0 {
                        self.accum = (self.accum << 8) | u32::from(data[0]);
                        self.remaining -= 1;
                        data = &data[1..];
                    }
                    if self.remaining == 0 {
                        self.header.stream = self.accum as u16 as i16;
                        self.state = DecodeState::Opcode;
                    }
                }
                DecodeState::Opcode => {
                    self.header.opcode = data[0];
                    self.accum = 0;
                    self.remaining = 4;
                    self.state = DecodeState::Length;
                    data = &data[1..];
                }
                DecodeState::Length => {
                    while !data.is_empty() && self.remaining > 0 {
                        self.accum = (self.accum << 8) | u32::from(data[0]);
                        self.remaining -= 1;
                        data = &data[1..];
                    }
                    if self.remaining == 0 {
                        self.header.length = self.accum as i32;
                        sink.header_done(&self.header)?;
                        if self.header.length <= 0 {
                            sink.body_done()?;
                            self.state = DecodeState::Version;
                        } else {
                            self.remaining = self.header.length as usize;
                            self.state = DecodeState::Body;
                        }
                    }
                }
                DecodeState::Body => {
                    let take = data.len().min(self.remaining);
                    sink.body_chunk(&data[..take])?;
                    self.remaining -= take;
                    data = &data[take..];
                    if self.remaining == 0 {
                        sink.body_done()?;
                        self.state = DecodeState::Version;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
