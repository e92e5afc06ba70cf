pub mod frame;
pub mod primitive;

pub use frame::{FrameDecoder, FrameHeader, FrameInfo, FrameSink};
