//! Wire-level constants for the CQL native protocol (v3/v4 subset).

/// Fixed frame header: version, flags, stream (i16), opcode, body length (i32).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest frame body the proxy accepts from a client or the backend.
pub const MAX_FRAME_SIZE: i32 = 8 * 1024 * 1024;

/// Initial capacity reserved for a frame body before it proves larger.
pub const MAX_BODY_INLINE: usize = 8 * 1024;

/// Per-client TCP read buffer.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Outstanding batches a client may accumulate between flush ticks.
pub const MAX_BATCH: usize = 64;

/// Responses per batch (one scatter-gather write each).
pub const MAX_BATCH_SIZE: usize = 1024;

/// Requests buffered per client while a keyspace connect is pending.
pub const MAX_QUEUED: usize = 64;

/// Sizing hint for the cross-task client queues.
pub const MAX_CLIENTS: usize = 128;

/// Protocol versions accepted on inbound frames.
pub const PROTOCOL_VERSION_MIN: u8 = 0x03;
pub const PROTOCOL_VERSION_MAX: u8 = 0x04;

/// Version byte on every outbound reply: v4, response direction bit set.
pub const RESPONSE_VERSION: u8 = 0x84;

/// Version byte on frames the proxy itself sends to the backend.
pub const REQUEST_VERSION: u8 = 0x04;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Error,
            0x01 => Self::Startup,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x04 => Self::Credentials,
            0x05 => Self::Options,
            0x06 => Self::Supported,
            0x07 => Self::Query,
            0x08 => Self::Result,
            0x09 => Self::Prepare,
            0x0A => Self::Execute,
            0x0B => Self::Register,
            0x0C => Self::Event,
            0x0D => Self::Batch,
            0x0E => Self::AuthChallenge,
            0x0F => Self::AuthResponse,
            0x10 => Self::AuthSuccess,
            _ => return None,
        })
    }
}

/// Error codes from the native protocol ERROR frame.
pub mod error_code {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub const TRUNCATE_ERROR: i32 = 0x1003;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const SYNTAX_ERROR: i32 = 0x2000;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const INVALID_QUERY: i32 = 0x2200;
    pub const CONFIG_ERROR: i32 = 0x2300;
    pub const ALREADY_EXISTS: i32 = 0x2400;
    pub const UNPREPARED: i32 = 0x2500;
}

/// RESULT frame kinds.
pub mod result_kind {
    pub const VOID: i32 = 1;
    pub const ROWS: i32 = 2;
    pub const SET_KEYSPACE: i32 = 3;
    pub const PREPARED: i32 = 4;
    pub const SCHEMA_CHANGE: i32 = 5;
}

/// Column type ids used in result metadata.
pub mod cql_type {
    pub const CUSTOM: u16 = 0x0000;
    pub const ASCII: u16 = 0x0001;
    pub const BIGINT: u16 = 0x0002;
    pub const BLOB: u16 = 0x0003;
    pub const BOOLEAN: u16 = 0x0004;
    pub const COUNTER: u16 = 0x0005;
    pub const DECIMAL: u16 = 0x0006;
    pub const DOUBLE: u16 = 0x0007;
    pub const FLOAT: u16 = 0x0008;
    pub const INT: u16 = 0x0009;
    pub const TIMESTAMP: u16 = 0x000B;
    pub const UUID: u16 = 0x000C;
    pub const VARCHAR: u16 = 0x000D;
    pub const VARINT: u16 = 0x000E;
    pub const TIMEUUID: u16 = 0x000F;
    pub const INET: u16 = 0x0010;
    pub const DATE: u16 = 0x0011;
    pub const TIME: u16 = 0x0012;
    pub const SMALLINT: u16 = 0x0013;
    pub const TINYINT: u16 = 0x0014;
    pub const LIST: u16 = 0x0020;
    pub const MAP: u16 = 0x0021;
    pub const SET: u16 = 0x0022;
    pub const UDT: u16 = 0x0030;
    pub const TUPLE: u16 = 0x0031;
}

bitflags::bitflags! {
    /// Flags byte of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSION = 0x01;
        const TRACING = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
        const WARNING = 0x08;
    }
}

bitflags::bitflags! {
    /// Flags byte inside a QUERY/EXECUTE body, after the consistency level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u8 {
        const VALUES = 0x01;
        const SKIP_METADATA = 0x02;
        const PAGE_SIZE = 0x04;
        const WITH_PAGING_STATE = 0x08;
        const WITH_SERIAL_CONSISTENCY = 0x10;
        const WITH_DEFAULT_TIMESTAMP = 0x20;
        const WITH_NAMES_FOR_VALUES = 0x40;
    }
}

bitflags::bitflags! {
    /// Flags word of a ROWS result's metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RowsFlags: i32 {
        const GLOBAL_TABLESPEC = 0x0001;
        const HAS_MORE_PAGES = 0x0002;
        const NO_METADATA = 0x0004;
        const METADATA_CHANGED = 0x0008;
    }
}
