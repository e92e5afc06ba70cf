//! Hand-written native-protocol connection to the backend cluster.
//!
//! The proxy forwards client frames bodily, so the backend side only needs a
//! thin driver: connect, handshake (with SASL PLAIN when challenged), scope to
//! a keyspace, and round-trip one raw frame at a time. Stream ids on this hop
//! belong to the proxy; the caller substitutes the client's id on the reply.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::instrument;
use zerocopy::FromBytes;

use crate::constant::{
    FRAME_HEADER_SIZE, MAX_FRAME_SIZE, Opcode, REQUEST_VERSION, RowsFlags, cql_type, result_kind,
};
use crate::error::{Error, Result};
use crate::protocol::frame::FrameHeader;
use crate::protocol::primitive::{
    read_bytes, read_int32, read_string, read_uint16, write_long_string, write_string,
    write_uint8, write_uint16, write_value_bytes,
};
use crate::synth::CQL_VERSION;

/// How to reach and authenticate against the backend cluster.
#[derive(Debug, Clone)]
pub struct BackendOpts {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Cluster facts learned at boot and echoed in synthesized `system.local` rows.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub release_version: String,
    pub partitioner: String,
}

/// One backend reply, body untouched. The opcode may be ERROR; raw forwarding
/// passes those to the client unchanged.
#[derive(Debug)]
pub struct RawResult {
    pub opcode: u8,
    pub body: Vec<u8>,
}

/// A backend connection with a buffered async TCP stream.
pub struct Conn {
    stream: BufReader<TcpStream>,
    /// Reusable buffer for reading frame bodies
    read_buffer: Vec<u8>,
    /// Reusable buffer for building outgoing bodies
    write_buffer: Vec<u8>,
}

impl Conn {
    /// Connect and drive the handshake: STARTUP, then either READY or an
    /// AUTHENTICATE challenge answered with SASL PLAIN credentials.
    #[instrument(skip_all, fields(host = %opts.host, port = opts.port))]
    pub async fn connect(opts: &BackendOpts) -> Result<Self> {
        let stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufReader::new(stream),
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        };

        conn.write_buffer.clear();
        write_uint16(&mut conn.write_buffer, 1);
        write_string(&mut conn.write_buffer, "CQL_VERSION");
        write_string(&mut conn.write_buffer, CQL_VERSION);
        let body = std::mem::take(&mut conn.write_buffer);
        conn.write_frame(Opcode::Startup as u8, 0, &body).await?;
        conn.write_buffer = body;

        let header = conn.read_frame().await?;
        match Opcode::from_u8(header.opcode) {
            Some(Opcode::Ready) => Ok(conn),
            Some(Opcode::Authenticate) => {
                conn.authenticate(&opts.username, &opts.password).await?;
                Ok(conn)
            }
            Some(Opcode::Error) => Err(decode_error(&conn.read_buffer)),
            _ => Err(Error::Protocol("unexpected handshake reply")),
        }
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mut token = Vec::with_capacity(username.len() + password.len() + 2);
        token.push(0);
        token.extend_from_slice(username.as_bytes());
        token.push(0);
        token.extend_from_slice(password.as_bytes());

        let mut body = Vec::with_capacity(4 + token.len());
        write_value_bytes(&mut body, Some(&token));
        self.write_frame(Opcode::AuthResponse as u8, 0, &body).await?;

        let header = self.read_frame().await?;
        match Opcode::from_u8(header.opcode) {
            Some(Opcode::AuthSuccess) => Ok(()),
            Some(Opcode::Error) => Err(decode_error(&self.read_buffer)),
            _ => Err(Error::Protocol("unexpected authentication reply")),
        }
    }

    /// Scope this connection to a keyspace. A backend rejection surfaces as
    /// [`Error::Backend`], which callers map to the client's `USE` failure.
    pub async fn use_keyspace(&mut self, keyspace: &str) -> Result<()> {
        let result = self.query(&format!("USE {keyspace}")).await?;
        if result.opcode == Opcode::Error as u8 {
            return Err(decode_error(&result.body));
        }
        Ok(())
    }

    /// Round-trip one raw frame. EVENT frames pushed by the backend are
    /// skipped; the first direct reply is returned with its body untouched.
    #[instrument(skip_all, fields(opcode = opcode))]
    pub async fn execute_raw(&mut self, opcode: u8, flags: u8, body: &[u8]) -> Result<RawResult> {
        self.write_frame(opcode, flags, body).await?;
        loop {
            let header = self.read_frame().await?;
            if header.opcode == Opcode::Event as u8 {
                continue;
            }
            return Ok(RawResult {
                opcode: header.opcode,
                body: std::mem::take(&mut self.read_buffer),
            });
        }
    }

    /// Issue a plain QUERY at consistency ONE with no values.
    pub async fn query(&mut self, query: &str) -> Result<RawResult> {
        self.write_buffer.clear();
        write_long_string(&mut self.write_buffer, query.as_bytes());
        write_uint16(&mut self.write_buffer, 0x0001);
        write_uint8(&mut self.write_buffer, 0);
        let body = std::mem::take(&mut self.write_buffer);
        let result = self.execute_raw(Opcode::Query as u8, 0, &body).await;
        self.write_buffer = body;
        result
    }

    /// Fetch the release version and partitioner the proxy advertises.
    pub async fn boot_metadata(&mut self) -> Result<BootInfo> {
        let result = self
            .query("SELECT release_version, partitioner FROM system.local")
            .await?;
        if result.opcode == Opcode::Error as u8 {
            return Err(decode_error(&result.body));
        }
        if result.opcode != Opcode::Result as u8 {
            return Err(Error::Protocol("unexpected reply to metadata query"));
        }
        parse_boot_rows(&result.body)
    }

    async fn write_frame(&mut self, opcode: u8, flags: u8, body: &[u8]) -> Result<()> {
        let header =
            FrameHeader::new(REQUEST_VERSION, flags, 0, opcode, body.len() as i32).encode();
        let stream = self.stream.get_mut();
        stream.write_all(&header).await?;
        stream.write_all(body).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one frame; the body lands in `read_buffer`.
    async fn read_frame(&mut self) -> Result<FrameHeader> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        self.stream.read_exact(&mut header_bytes).await?;
        let header = FrameHeader::read_from_bytes(&header_bytes)
            .map_err(|_| Error::Protocol("short frame header"))?;

        let length = header.length();
        if length < 0 || length > MAX_FRAME_SIZE {
            return Err(Error::Protocol("backend frame length out of range"));
        }
        self.read_buffer.clear();
        self.read_buffer.resize(length as usize, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;
        Ok(header)
    }
}

/// Decode an ERROR frame body into [`Error::Backend`].
pub fn decode_error(body: &[u8]) -> Error {
    let parsed = (|| -> Result<(i32, String)> {
        let (code, rest) = read_int32(body)?;
        let (message, _) = read_string(rest)?;
        let message = simdutf8::basic::from_utf8(message)
            .map_err(|_| Error::Protocol("non-utf8 error message"))?;
        Ok((code, message.to_string()))
    })();
    match parsed {
        Ok((code, message)) => Error::Backend { code, message },
        Err(_) => Error::Protocol("malformed backend error frame"),
    }
}

/// Pull the two metadata strings out of a ROWS result body.
fn parse_boot_rows(body: &[u8]) -> Result<BootInfo> {
    let (kind, rest) = read_int32(body)?;
    if kind != result_kind::ROWS {
        return Err(Error::Protocol("expected a rows result"));
    }
    let (flag_bits, rest) = read_int32(rest)?;
    let flags = RowsFlags::from_bits_truncate(flag_bits);
    if flags.contains(RowsFlags::NO_METADATA) {
        return Err(Error::Protocol("metadata missing from rows result"));
    }
    let (column_count, mut rest) = read_int32(rest)?;
    if column_count < 0 {
        return Err(Error::Protocol("negative column count"));
    }
    if flags.contains(RowsFlags::HAS_MORE_PAGES) {
        let (_paging_state, r) = read_bytes(rest)?;
        rest = r;
    }
    if flags.contains(RowsFlags::GLOBAL_TABLESPEC) {
        let (_keyspace, r) = read_string(rest)?;
        let (_table, r) = read_string(r)?;
        rest = r;
    }

    let mut names = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        if !flags.contains(RowsFlags::GLOBAL_TABLESPEC) {
            let (_keyspace, r) = read_string(rest)?;
            let (_table, r) = read_string(r)?;
            rest = r;
        }
        let (name, r) = read_string(rest)?;
        rest = skip_column_type(r)?;
        names.push(name.to_vec());
    }

    let (row_count, mut rest) = read_int32(rest)?;
    if row_count < 1 {
        return Err(Error::Protocol("no system.local row in metadata result"));
    }

    let mut release_version = None;
    let mut partitioner = None;
    for name in &names {
        let (value, r) = read_bytes(rest)?;
        rest = r;
        let Some(value) = value else { continue };
        let text = simdutf8::basic::from_utf8(value)
            .map_err(|_| Error::Protocol("non-utf8 metadata value"))?;
        match name.as_slice() {
            b"release_version" => release_version = Some(text.to_string()),
            b"partitioner" => partitioner = Some(text.to_string()),
            _ => {}
        }
    }

    match (release_version, partitioner) {
        (Some(release_version), Some(partitioner)) => Ok(BootInfo {
            release_version,
            partitioner,
        }),
        _ => Err(Error::Protocol(
            "metadata result missing release_version or partitioner",
        )),
    }
}

fn skip_column_type(data: &[u8]) -> Result<&[u8]> {
    let (id, rest) = read_uint16(data)?;
    match id {
        cql_type::CUSTOM => {
            let (_class, rest) = read_string(rest)?;
            Ok(rest)
        }
        cql_type::LIST | cql_type::SET => skip_column_type(rest),
        cql_type::MAP => skip_column_type(skip_column_type(rest)?),
        cql_type::UDT | cql_type::TUPLE => {
            Err(Error::Protocol("unsupported column type in metadata"))
        }
        _ => Ok(rest),
    }
}
