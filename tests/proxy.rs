//! End-to-end tests: a real proxy instance wired to an in-process mock
//! backend that speaks just enough of the native protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use cql_proxy::backend::BackendOpts;
use cql_proxy::constant::{Opcode, cql_type, error_code, result_kind};
use cql_proxy::protocol::primitive::{
    read_bytes, read_int32, read_string, read_uint16, write_int32, write_long_string,
    write_string, write_uint16, write_value_bytes,
};
use cql_proxy::proxy::server;

const MOCK_RELEASE_VERSION: &str = "4.0.11-mock";
const MOCK_PARTITIONER: &str = "org.example.Mock3Partitioner";

/// How long the mock holds a `USE slow*` reply, keeping the connect pending.
const SLOW_USE_DELAY: Duration = Duration::from_millis(400);

const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn encode_frame(version: u8, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + body.len());
    out.push(version);
    out.push(0);
    out.extend_from_slice(&stream.to_be_bytes());
    out.push(opcode);
    out.extend_from_slice(&(body.len() as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

async fn send_frame(socket: &mut TcpStream, stream: i16, opcode: u8, body: &[u8]) {
    socket
        .write_all(&encode_frame(0x04, stream, opcode, body))
        .await
        .expect("send frame");
}

struct Reply {
    version: u8,
    stream: i16,
    opcode: u8,
    body: Vec<u8>,
}

async fn read_reply(socket: &mut TcpStream) -> Reply {
    timeout(IO_TIMEOUT, read_reply_inner(socket))
        .await
        .expect("timed out waiting for reply")
        .expect("read reply")
}

async fn read_reply_inner(socket: &mut TcpStream) -> std::io::Result<Reply> {
    let mut header = [0u8; 9];
    socket.read_exact(&mut header).await?;
    let length = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let mut body = vec![0u8; length as usize];
    socket.read_exact(&mut body).await?;
    Ok(Reply {
        version: header[0],
        stream: i16::from_be_bytes([header[2], header[3]]),
        opcode: header[4],
        body,
    })
}

fn query_body(query: &str) -> Vec<u8> {
    let mut body = Vec::new();
    write_long_string(&mut body, query.as_bytes());
    write_uint16(&mut body, 0x0001);
    body.push(0);
    body
}

fn execute_body(id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write_uint16(&mut body, id.len() as u16);
    body.extend_from_slice(id);
    write_uint16(&mut body, 0x0001);
    body.push(0);
    body
}

fn error_code_of(body: &[u8]) -> i32 {
    read_int32(body).expect("error code").0
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

fn boot_rows_body() -> Vec<u8> {
    let mut out = Vec::new();
    write_int32(&mut out, result_kind::ROWS);
    write_int32(&mut out, 0x0001); // global tablespec
    write_int32(&mut out, 2);
    write_string(&mut out, "system");
    write_string(&mut out, "local");
    for name in ["release_version", "partitioner"] {
        write_string(&mut out, name);
        write_uint16(&mut out, cql_type::VARCHAR);
    }
    write_int32(&mut out, 1);
    write_value_bytes(&mut out, Some(MOCK_RELEASE_VERSION.as_bytes()));
    write_value_bytes(&mut out, Some(MOCK_PARTITIONER.as_bytes()));
    out
}

fn mock_error_body(code: i32, message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_int32(&mut out, code);
    write_string(&mut out, message);
    out
}

/// Serve one backend connection: READY on STARTUP, canned metadata for the
/// boot query, Set_Keyspace (possibly slow or failing) for USE, and an
/// "ECHO"-prefixed RESULT for everything else.
async fn mock_backend_conn(mut socket: TcpStream) {
    loop {
        let mut header = [0u8; 9];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let stream = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let length = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        let mut body = vec![0u8; length as usize];
        if socket.read_exact(&mut body).await.is_err() {
            return;
        }

        let reply = match Opcode::from_u8(opcode) {
            Some(Opcode::Startup) => encode_frame(0x84, stream, Opcode::Ready as u8, &[]),
            Some(Opcode::Query) => {
                let (query, _) = read_string_long(&body);
                if query.starts_with("SELECT release_version") {
                    encode_frame(0x84, stream, Opcode::Result as u8, &boot_rows_body())
                } else if let Some(keyspace) = query.strip_prefix("USE ") {
                    if keyspace.starts_with("slow") {
                        tokio::time::sleep(SLOW_USE_DELAY).await;
                    }
                    if keyspace.contains("bad") {
                        let body = mock_error_body(
                            error_code::INVALID_QUERY,
                            "Keyspace does not exist",
                        );
                        encode_frame(0x84, stream, Opcode::Error as u8, &body)
                    } else {
                        let mut out = Vec::new();
                        write_int32(&mut out, result_kind::SET_KEYSPACE);
                        write_string(&mut out, keyspace);
                        encode_frame(0x84, stream, Opcode::Result as u8, &out)
                    }
                } else {
                    echo_frame(stream, &body)
                }
            }
            Some(Opcode::Execute) => echo_frame(stream, &body),
            _ => {
                let body =
                    mock_error_body(error_code::PROTOCOL_ERROR, "mock: unsupported opcode");
                encode_frame(0x84, stream, Opcode::Error as u8, &body)
            }
        };
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn echo_frame(stream: i16, request_body: &[u8]) -> Vec<u8> {
    let mut out = b"ECHO".to_vec();
    out.extend_from_slice(request_body);
    encode_frame(0x84, stream, Opcode::Result as u8, &out)
}

fn read_string_long(body: &[u8]) -> (String, &[u8]) {
    let (len, rest) = body.split_at(4);
    let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    let (text, rest) = rest.split_at(len.min(rest.len()));
    (String::from_utf8_lossy(text).to_string(), rest)
}

async fn spawn_mock_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(mock_backend_conn(socket));
        }
    });
    addr
}

/// Boot a proxy against a fresh mock backend and return a connected client.
async fn start_proxy() -> TcpStream {
    let backend_addr = spawn_mock_backend().await;
    let opts = BackendOpts {
        host: backend_addr.ip().to_string(),
        port: backend_addr.port(),
        username: "cassandra".to_string(),
        password: "cassandra".to_string(),
    };

    let proxy = server::bootstrap(opts).await.expect("bootstrap");
    assert_eq!(proxy.boot.release_version, MOCK_RELEASE_VERSION);
    assert_eq!(proxy.boot.partitioner, MOCK_PARTITIONER);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(async move {
        let _ = server::serve(listener, Arc::clone(&proxy)).await;
    });

    let socket = TcpStream::connect(addr).await.expect("connect proxy");
    socket.set_nodelay(true).expect("nodelay");
    socket
}

// ---------------------------------------------------------------------------
// Decoding synthesized rows
// ---------------------------------------------------------------------------

struct Rows {
    columns: Vec<String>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
}

fn decode_rows(body: &[u8]) -> Rows {
    let (kind, rest) = read_int32(body).expect("kind");
    assert_eq!(kind, result_kind::ROWS);
    let (flags, rest) = read_int32(rest).expect("flags");
    assert_eq!(flags, 0x0001, "expected global tablespec metadata");
    let (column_count, rest) = read_int32(rest).expect("column count");
    let (_keyspace, rest) = read_string(rest).expect("keyspace");
    let (_table, mut rest) = read_string(rest).expect("table");

    let mut columns = Vec::new();
    for _ in 0..column_count {
        let (name, r) = read_string(rest).expect("column name");
        let (type_id, r) = read_uint16(r).expect("type id");
        let r = if type_id == cql_type::SET {
            read_uint16(r).expect("element type").1
        } else {
            r
        };
        columns.push(String::from_utf8(name.to_vec()).expect("utf8 name"));
        rest = r;
    }

    let (row_count, mut rest) = read_int32(rest).expect("row count");
    let mut rows = Vec::new();
    for _ in 0..row_count {
        let mut row = Vec::new();
        for _ in 0..column_count {
            let (value, r) = read_bytes(rest).expect("value");
            row.push(value.map(<[u8]>::to_vec));
            rest = r;
        }
        rows.push(row);
    }
    Rows { columns, rows }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn options_startup_and_intercepted_query() {
    let mut socket = start_proxy().await;

    // OPTIONS -> SUPPORTED with CQL_VERSION and empty COMPRESSION.
    send_frame(&mut socket, 1, Opcode::Options as u8, &[]).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.version, 0x84);
    assert_eq!(reply.stream, 1);
    assert_eq!(reply.opcode, Opcode::Supported as u8);
    let (entries, rest) = read_uint16(&reply.body).expect("map size");
    assert_eq!(entries, 2);
    let (key, rest) = read_string(rest).expect("key");
    assert_eq!(key, b"CQL_VERSION");
    let (values, rest) = read_uint16(rest).expect("value count");
    assert_eq!(values, 1);
    let (version, _) = read_string(rest).expect("version");
    assert_eq!(version, b"3.0.0");

    // STARTUP -> READY, empty body, stream echoed.
    let mut startup = Vec::new();
    write_uint16(&mut startup, 1);
    write_string(&mut startup, "CQL_VERSION");
    write_string(&mut startup, "3.0.0");
    send_frame(&mut socket, 2, Opcode::Startup as u8, &startup).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 2);
    assert_eq!(reply.opcode, Opcode::Ready as u8);
    assert!(reply.body.is_empty());

    // Intercepted topology query.
    send_frame(
        &mut socket,
        3,
        Opcode::Query as u8,
        &query_body("SELECT * FROM system.local"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 3);
    assert_eq!(reply.opcode, Opcode::Result as u8);
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns.len(), 12);
    assert_eq!(rows.rows.len(), 1);
    let row = &rows.rows[0];
    let index = |name: &str| rows.columns.iter().position(|c| c == name).expect("column");
    assert_eq!(
        row[index("release_version")].as_deref(),
        Some(MOCK_RELEASE_VERSION.as_bytes())
    );
    assert_eq!(
        row[index("partitioner")].as_deref(),
        Some(MOCK_PARTITIONER.as_bytes())
    );
    assert_eq!(row[index("rpc_address")].as_deref(), Some(&[127, 0, 0, 1][..]));
    assert_eq!(row[index("data_center")].as_deref(), Some(b"dc1".as_slice()));

    // system.peers synthesizes an empty row set.
    send_frame(
        &mut socket,
        4,
        Opcode::Query as u8,
        &query_body("SELECT * FROM system.peers"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns.len(), 8);
    assert!(rows.rows.is_empty());
}

#[tokio::test]
async fn forwarded_query_keeps_body_and_rewrites_stream() {
    let mut socket = start_proxy().await;

    let body = query_body("SELECT * FROM app.users");
    send_frame(&mut socket, 4, Opcode::Query as u8, &body).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 4);
    assert_eq!(reply.opcode, Opcode::Result as u8);
    assert_eq!(&reply.body[..4], b"ECHO");
    // The backend saw the identical body.
    assert_eq!(&reply.body[4..], &body[..]);
}

#[tokio::test]
async fn projection_and_count_queries() {
    let mut socket = start_proxy().await;

    send_frame(
        &mut socket,
        1,
        Opcode::Query as u8,
        &query_body("select release_version as v, partitioner from system.local"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns, vec!["v", "partitioner"]);
    assert_eq!(
        rows.rows[0][0].as_deref(),
        Some(MOCK_RELEASE_VERSION.as_bytes())
    );

    send_frame(
        &mut socket,
        2,
        Opcode::Query as u8,
        &query_body("SELECT COUNT(*) FROM system.peers"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns, vec!["count"]);
    assert_eq!(rows.rows[0][0].as_deref(), Some(&0i32.to_be_bytes()[..]));

    // Unknown column -> INVALID_QUERY.
    send_frame(
        &mut socket,
        3,
        Opcode::Query as u8,
        &query_body("SELECT bogus FROM system.local"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(error_code_of(&reply.body), error_code::INVALID_QUERY);
}

#[tokio::test]
async fn peers_v2_does_not_exist() {
    let mut socket = start_proxy().await;

    send_frame(
        &mut socket,
        9,
        Opcode::Query as u8,
        &query_body("SELECT * FROM system.peers_v2"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 9);
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(error_code_of(&reply.body), error_code::INVALID_QUERY);
}

#[tokio::test]
async fn unsupported_opcode_is_protocol_error() {
    let mut socket = start_proxy().await;

    send_frame(&mut socket, 5, Opcode::Batch as u8, &[]).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(error_code_of(&reply.body), error_code::PROTOCOL_ERROR);
}

#[tokio::test]
async fn oversized_frame_is_rejected_and_closes() {
    let mut socket = start_proxy().await;

    // Header declares a 9 MiB body; no body follows.
    let mut header = vec![0x04u8, 0, 0, 1, Opcode::Query as u8];
    header.extend_from_slice(&(9 * 1024 * 1024i32).to_be_bytes());
    socket.write_all(&header).await.expect("send header");

    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(error_code_of(&reply.body), error_code::PROTOCOL_ERROR);

    // The proxy closes after the error drains.
    let mut rest = Vec::new();
    let eof = timeout(IO_TIMEOUT, socket.read_to_end(&mut rest)).await;
    assert!(matches!(eof, Ok(Ok(0))));
}

#[tokio::test]
async fn use_flow_suspends_and_replays_in_order() {
    let mut socket = start_proxy().await;

    // Pipeline: USE (slow connect), a second USE, and a data query, written
    // as one buffer so they land in the same read chunk.
    let mut pipeline = Vec::new();
    pipeline.extend_from_slice(&encode_frame(
        0x04,
        5,
        Opcode::Query as u8,
        &query_body("USE slowks"),
    ));
    pipeline.extend_from_slice(&encode_frame(
        0x04,
        6,
        Opcode::Query as u8,
        &query_body("USE slowks"),
    ));
    pipeline.extend_from_slice(&encode_frame(
        0x04,
        7,
        Opcode::Query as u8,
        &query_body("SELECT * FROM app.users"),
    ));
    socket.write_all(&pipeline).await.expect("send pipeline");

    let first = read_reply(&mut socket).await;
    let second = read_reply(&mut socket).await;
    let third = read_reply(&mut socket).await;

    // Stream 5 resolves first, then the buffered requests in arrival order.
    assert_eq!(first.stream, 5);
    assert_eq!(first.opcode, Opcode::Result as u8);
    let (kind, rest) = read_int32(&first.body).expect("kind");
    assert_eq!(kind, result_kind::SET_KEYSPACE);
    let (keyspace, _) = read_string(rest).expect("keyspace");
    assert_eq!(keyspace, b"slowks");

    assert_eq!(second.stream, 6);
    assert_eq!(second.opcode, Opcode::Result as u8);
    let (kind, _) = read_int32(&second.body).expect("kind");
    assert_eq!(kind, result_kind::SET_KEYSPACE);

    assert_eq!(third.stream, 7);
    assert_eq!(third.opcode, Opcode::Result as u8);
    assert_eq!(&third.body[..4], b"ECHO");
}

#[tokio::test]
async fn use_failure_resets_keyspace() {
    let mut socket = start_proxy().await;

    send_frame(&mut socket, 1, Opcode::Query as u8, &query_body("USE badks")).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 1);
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(error_code_of(&reply.body), error_code::INVALID_QUERY);

    // The keyspace reset to the default session; forwarding still works.
    send_frame(
        &mut socket,
        2,
        Opcode::Query as u8,
        &query_body("SELECT * FROM app.users"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 2);
    assert_eq!(&reply.body[..4], b"ECHO");
}

#[tokio::test]
async fn bare_table_select_follows_session_keyspace() {
    let mut socket = start_proxy().await;

    // Without a keyspace, a bare `FROM local` is somebody else's table.
    send_frame(
        &mut socket,
        1,
        Opcode::Query as u8,
        &query_body("SELECT * FROM local"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(&reply.body[..4], b"ECHO");

    // After USE system it resolves to system.local and is intercepted.
    send_frame(&mut socket, 2, Opcode::Query as u8, &query_body("USE system")).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Result as u8);

    send_frame(
        &mut socket,
        3,
        Opcode::Query as u8,
        &query_body("SELECT * FROM local"),
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Result as u8);
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns.len(), 12);
}

#[tokio::test]
async fn queued_request_overflow_is_overloaded() {
    let mut socket = start_proxy().await;

    // One pipelined buffer: a slow USE followed by 65 queries. The 64-slot
    // queue takes the first 64; the 65th is rejected immediately.
    let mut pipeline = encode_frame(0x04, 1, Opcode::Query as u8, &query_body("USE slowks2"));
    for i in 0..65i16 {
        pipeline.extend_from_slice(&encode_frame(
            0x04,
            100 + i,
            Opcode::Query as u8,
            &query_body("SELECT * FROM app.users"),
        ));
    }
    socket.write_all(&pipeline).await.expect("send pipeline");

    let mut set_keyspace = 0;
    let mut echoes = 0;
    let mut overloaded = Vec::new();
    for _ in 0..67 {
        let reply = read_reply(&mut socket).await;
        if reply.opcode == Opcode::Error as u8 {
            assert_eq!(error_code_of(&reply.body), error_code::OVERLOADED);
            overloaded.push(reply.stream);
        } else if read_int32(&reply.body).expect("kind").0 == result_kind::SET_KEYSPACE {
            set_keyspace += 1;
        } else {
            assert_eq!(&reply.body[..4], b"ECHO");
            echoes += 1;
        }
    }
    assert_eq!(set_keyspace, 1);
    assert_eq!(echoes, 64);
    assert_eq!(overloaded, vec![164]);
}

#[tokio::test]
async fn prepare_and_execute_intercepted() {
    let mut socket = start_proxy().await;

    send_frame(
        &mut socket,
        1,
        Opcode::Prepare as u8,
        &{
            let mut body = Vec::new();
            write_long_string(&mut body, b"SELECT * FROM system.local");
            body
        },
    )
    .await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.opcode, Opcode::Result as u8);
    let (kind, rest) = read_int32(&reply.body).expect("kind");
    assert_eq!(kind, result_kind::PREPARED);
    let (id, _) = read_string(rest).expect("prepared id");
    assert_eq!(id.len(), 16);

    // EXECUTE with the returned id serves from the cached template.
    let id = id.to_vec();
    send_frame(&mut socket, 2, Opcode::Execute as u8, &execute_body(&id)).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 2);
    assert_eq!(reply.opcode, Opcode::Result as u8);
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns.len(), 12);
    assert_eq!(rows.rows.len(), 1);
}

#[tokio::test]
async fn execute_unknown_id_passes_through() {
    let mut socket = start_proxy().await;

    // A well-formed 16-byte id that is not in the cache.
    let body = execute_body(&[0xABu8; 16]);
    send_frame(&mut socket, 7, Opcode::Execute as u8, &body).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 7);
    assert_eq!(&reply.body[..4], b"ECHO");
    assert_eq!(&reply.body[4..], &body[..]);

    // Ids of any other length are forwarded too.
    let body = execute_body(&[0xCD; 3]);
    send_frame(&mut socket, 8, Opcode::Execute as u8, &body).await;
    let reply = read_reply(&mut socket).await;
    assert_eq!(&reply.body[..4], b"ECHO");
}

#[tokio::test]
async fn fragmented_frames_decode_identically() {
    let mut socket = start_proxy().await;

    // Dribble a query one byte at a time; the reply is the same as whole.
    let frame = encode_frame(
        0x04,
        11,
        Opcode::Query as u8,
        &query_body("SELECT key FROM system.local"),
    );
    for byte in &frame {
        socket.write_all(&[*byte]).await.expect("send byte");
        socket.flush().await.expect("flush");
    }
    let reply = read_reply(&mut socket).await;
    assert_eq!(reply.stream, 11);
    assert_eq!(reply.opcode, Opcode::Result as u8);
    let rows = decode_rows(&reply.body);
    assert_eq!(rows.columns, vec!["key"]);
    assert_eq!(rows.rows[0][0].as_deref(), Some(b"local".as_slice()));
}
