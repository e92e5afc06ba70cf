//! Per-connection protocol driver.
//!
//! Each accepted socket gets two tasks: a reader that reassembles frames and
//! dispatches requests, and a writer that drains response batches. Requests
//! either synthesize a reply on the spot (topology queries, `USE`) or forward
//! the raw frame to the backend; a completion task then re-headers the raw
//! result with the client's stream id.
//!
//! `USE <keyspace>` against an unconnected session suspends the reader.
//! Frames already decoded keep arriving while suspended; they are buffered in
//! arrival order and replayed through the normal dispatch path once the
//! keyspace connect resolves.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::backend::RawResult;
use crate::constant::{
    MAX_BATCH, MAX_BODY_INLINE, MAX_FRAME_SIZE, MAX_QUEUED, Opcode, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN, QueryFlags, READ_BUFFER_SIZE, error_code,
};
use crate::error::{Error, Result};
use crate::parse::{self, Expr, Statement, SystemTable};
use crate::protocol::frame::{FrameDecoder, FrameInfo, FrameSink};
use crate::protocol::primitive::{read_long_string, read_string, read_uint8, read_uint16};
use crate::proxy::Proxy;
use crate::proxy::batch::{Batch, Response, write_all_vectored};
use crate::session;
use crate::synth;

pub struct Client {
    proxy: Arc<Proxy>,
    peer: SocketAddr,
    shared: Mutex<Shared>,
    /// Wakes the writer task; signaled from the flush tick and on close.
    write_wake: Notify,
    /// Wakes a reader suspended on a pending `USE`.
    resume: Notify,
}

struct Shared {
    keyspace: String,
    batches: Vec<Batch>,
    is_closing: bool,
    queued: Vec<QueuedFrame>,
    /// Stream id of the outstanding `USE`, or -1 when none is pending.
    use_keyspace_stream: i16,
}

struct QueuedFrame {
    frame: FrameInfo,
    body: Bytes,
}

impl Client {
    pub fn new(proxy: Arc<Proxy>, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            peer,
            shared: Mutex::new(Shared {
                keyspace: String::new(),
                batches: Vec::new(),
                is_closing: false,
                queued: Vec::new(),
                use_keyspace_stream: -1,
            }),
            write_wake: Notify::new(),
            resume: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closing(&self) -> bool {
        self.lock().is_closing
    }

    fn reads_paused(&self) -> bool {
        self.lock().use_keyspace_stream >= 0
    }

    /// Stop accepting responses and let the writer drain what is queued.
    pub fn close(&self) {
        self.lock().is_closing = true;
        self.write_wake.notify_one();
        self.resume.notify_one();
    }

    /// Append a response to the current batch and schedule a flush.
    /// Thread-safe: called from the reader, the tick, and completion tasks.
    pub fn write_response(self: &Arc<Self>, stream: i16, opcode: u8, body: Bytes) {
        {
            let mut shared = self.lock();
            if shared.is_closing {
                return;
            }
            if shared.batches.last().is_none_or(Batch::is_full) {
                if shared.batches.len() >= MAX_BATCH {
                    warn!(client = %self.peer, "outstanding batch limit exceeded");
                }
                shared.batches.push(Batch::new());
            }
            if let Some(batch) = shared.batches.last_mut() {
                batch.push(Response::new(stream, opcode, body));
            }
        }
        if self.proxy.to_flush.push(self) {
            self.proxy.wake.notify_one();
        }
    }

    pub fn write_error(self: &Arc<Self>, stream: i16, code: i32, message: &str) {
        self.write_response(
            stream,
            Opcode::Error as u8,
            synth::error_body(code, message).into(),
        );
    }

    /// Forwarded result: keep the backend body verbatim, substitute the
    /// client's stream id in the header.
    pub fn write_raw(self: &Arc<Self>, stream: i16, result: RawResult) {
        self.write_response(stream, result.opcode, result.body.into());
    }

    fn take_batches(&self) -> (Vec<Batch>, bool) {
        let mut shared = self.lock();
        (std::mem::take(&mut shared.batches), shared.is_closing)
    }

    fn dispatch(self: &Arc<Self>, frame: &FrameInfo, body: Bytes) {
        // While a USE is pending every request is buffered; replay preserves
        // arrival order, so even a pipelined second USE resolves in turn.
        {
            let mut shared = self.lock();
            if shared.use_keyspace_stream >= 0 {
                if shared.queued.len() >= MAX_QUEUED {
                    drop(shared);
                    self.write_error(
                        frame.stream,
                        error_code::OVERLOADED,
                        "Unable to handle request",
                    );
                    return;
                }
                shared.queued.push(QueuedFrame {
                    frame: *frame,
                    body,
                });
                return;
            }
        }

        match Opcode::from_u8(frame.opcode) {
            Some(Opcode::Options) => self.write_response(
                frame.stream,
                Opcode::Supported as u8,
                synth::supported_body().into(),
            ),
            Some(Opcode::Startup | Opcode::Register) => {
                self.write_response(frame.stream, Opcode::Ready as u8, Bytes::new());
            }
            Some(Opcode::Query) => self.do_query(frame, body),
            Some(Opcode::Prepare) => self.do_prepare(frame, body),
            Some(Opcode::Execute) => self.do_execute(frame, body),
            _ => self.write_error(
                frame.stream,
                error_code::PROTOCOL_ERROR,
                "Unsupported operation",
            ),
        }
    }

    fn keyspace_is_system(&self) -> bool {
        self.lock().keyspace == "system"
    }

    fn do_query(self: &Arc<Self>, frame: &FrameInfo, body: Bytes) {
        // Classification is best-effort: anything that fails to decode or
        // parse is the backend's problem and goes through verbatim.
        let parsed = match read_long_string(&body) {
            Ok((query, rest)) => simdutf8::basic::from_utf8(query)
                .ok()
                .map(|query| (parse::parse(query), skip_metadata(rest))),
            Err(_) => None,
        };
        let Some((statement, skip)) = parsed else {
            self.forward(frame, body);
            return;
        };

        match statement {
            Some(Statement::Select {
                table,
                is_table,
                exprs,
            }) => {
                if !is_table && !self.keyspace_is_system() {
                    self.forward(frame, body);
                    return;
                }
                self.write_rows(frame.stream, &exprs, table, skip);
            }
            Some(Statement::Use { keyspace }) => self.do_use(frame.stream, &keyspace),
            None => self.forward(frame, body),
        }
    }

    fn do_prepare(self: &Arc<Self>, frame: &FrameInfo, body: Bytes) {
        let query = match read_long_string(&body) {
            Ok((query, _)) => simdutf8::basic::from_utf8(query).ok(),
            Err(_) => None,
        };
        let Some(query) = query else {
            self.forward(frame, body);
            return;
        };

        match parse::parse(query) {
            Some(Statement::Select {
                table,
                is_table,
                exprs,
            }) => {
                if !is_table && !self.keyspace_is_system() {
                    self.forward(frame, body);
                    return;
                }
                if table == SystemTable::PeersV2 {
                    self.write_error(frame.stream, error_code::INVALID_QUERY, "Doesn't exist");
                    return;
                }
                let stmt = Statement::Select {
                    table,
                    is_table,
                    exprs,
                };
                let entry = self.proxy.prepared.insert(query, stmt);
                self.write_prepared(frame.stream, &entry.id, &entry.stmt);
            }
            Some(stmt @ Statement::Use { .. }) => {
                let entry = self.proxy.prepared.insert(query, stmt);
                self.write_prepared(frame.stream, &entry.id, &entry.stmt);
            }
            None => self.forward(frame, body),
        }
    }

    fn do_execute(self: &Arc<Self>, frame: &FrameInfo, body: Bytes) {
        let decoded = read_string(&body)
            .map(|(id, rest)| (self.proxy.prepared.get(id), skip_metadata(rest)))
            .ok();
        let Some((entry, skip)) = decoded else {
            self.forward(frame, body);
            return;
        };
        let Some(entry) = entry else {
            self.forward(frame, body);
            return;
        };

        match &entry.stmt {
            Statement::Select { table, exprs, .. } => match table {
                SystemTable::Local | SystemTable::Peers => {
                    self.write_rows(frame.stream, exprs, *table, skip);
                }
                SystemTable::PeersV2 => {
                    // Never cached; a hit here means the cache is corrupt.
                    error!(client = %self.peer, "prepared entry references peers_v2");
                    self.write_error(
                        frame.stream,
                        error_code::SERVER_ERROR,
                        "Invalid prepared statement",
                    );
                }
            },
            Statement::Use { keyspace } => {
                let keyspace = keyspace.clone();
                self.do_use(frame.stream, &keyspace);
            }
        }
    }

    fn write_rows(self: &Arc<Self>, stream: i16, exprs: &[Expr], table: SystemTable, skip: bool) {
        match synth::rows_body(exprs, table, skip, &self.proxy.boot) {
            Ok(body) => self.write_response(stream, Opcode::Result as u8, body.into()),
            Err(err) => self.write_synth_error(stream, err),
        }
    }

    fn write_prepared(self: &Arc<Self>, stream: i16, id: &[u8; 16], stmt: &Statement) {
        match synth::prepared_body(id, stmt) {
            Ok(body) => self.write_response(stream, Opcode::Result as u8, body.into()),
            Err(err) => self.write_synth_error(stream, err),
        }
    }

    fn write_synth_error(self: &Arc<Self>, stream: i16, err: Error) {
        match err {
            Error::InvalidQuery(message) => {
                self.write_error(stream, error_code::INVALID_QUERY, message);
            }
            other => {
                error!(client = %self.peer, error = %other, "response synthesis failed");
                self.write_error(
                    stream,
                    error_code::SERVER_ERROR,
                    "Unable to synthesize response",
                );
            }
        }
    }

    fn do_use(self: &Arc<Self>, stream: i16, keyspace: &str) {
        let session = self.proxy.sessions.get(keyspace);
        {
            let mut shared = self.lock();
            if shared.use_keyspace_stream >= 0 {
                drop(shared);
                self.write_error(
                    stream,
                    error_code::OVERLOADED,
                    "Use keyspace already in progress",
                );
                return;
            }
            shared.keyspace = keyspace.to_string();
            if session.is_connected() {
                drop(shared);
                self.write_response(
                    stream,
                    Opcode::Result as u8,
                    synth::set_keyspace_body(keyspace).into(),
                );
                return;
            }
            shared.use_keyspace_stream = stream;
        }
        debug!(client = %self.peer, keyspace, "reads suspended for keyspace connect");
        session::connect_async(&session, &self.proxy, self);
    }

    /// Hand the raw frame to the backend; the spawned completion plays the
    /// role of a driver callback and may run concurrently with the reader.
    fn forward(self: &Arc<Self>, frame: &FrameInfo, body: Bytes) {
        let keyspace = { self.lock().keyspace.clone() };
        let session = if keyspace.is_empty() {
            self.proxy.sessions.default_session()
        } else {
            match self.proxy.sessions.find(&keyspace) {
                Some(session) if session.is_connected() => session,
                Some(_) => {
                    // The session is still connecting; buffer for replay.
                    let overflow = {
                        let mut shared = self.lock();
                        if shared.queued.len() >= MAX_QUEUED {
                            true
                        } else {
                            shared.queued.push(QueuedFrame {
                                frame: *frame,
                                body,
                            });
                            false
                        }
                    };
                    if overflow {
                        self.write_error(
                            frame.stream,
                            error_code::OVERLOADED,
                            "Unable to handle request",
                        );
                    }
                    return;
                }
                None => {
                    self.write_error(
                        frame.stream,
                        error_code::SERVER_ERROR,
                        "Unable to find session for keyspace",
                    );
                    return;
                }
            }
        };

        let client = Arc::clone(self);
        let proxy = Arc::clone(&self.proxy);
        let stream = frame.stream;
        let (opcode, flags) = (frame.opcode, frame.flags);
        tokio::spawn(async move {
            match session.execute_raw(&proxy.opts, opcode, flags, &body).await {
                Ok(result) => client.write_raw(stream, result),
                Err(err) => {
                    warn!(client = %client.peer, error = %err, "forwarded request failed");
                    client.write_error(stream, error_code::SERVER_ERROR, &err.to_string());
                }
            }
        });
    }

    /// Called from the keyspace-connect task on success, before the tick
    /// replays this client's buffered requests.
    pub fn use_keyspace_connected(self: &Arc<Self>, proxy: &Arc<Proxy>) {
        let (stream, keyspace) = {
            let shared = self.lock();
            (shared.use_keyspace_stream, shared.keyspace.clone())
        };
        if stream >= 0 {
            self.write_response(
                stream,
                Opcode::Result as u8,
                synth::set_keyspace_body(&keyspace).into(),
            );
        }
        if proxy.use_keyspace_success.push(self) {
            proxy.wake.notify_one();
        }
    }

    /// Called from the keyspace-connect task on failure.
    pub fn use_keyspace_failed(self: &Arc<Self>, proxy: &Arc<Proxy>, code: i32, message: &str) {
        let stream = self.lock().use_keyspace_stream;
        if stream >= 0 {
            self.write_error(stream, code, message);
        }
        if proxy.use_keyspace_failed.push(self) {
            proxy.wake.notify_one();
        }
    }

    /// Tick handler: clear the pending USE, replay buffered requests in
    /// arrival order, then resume reads.
    pub fn finish_use_keyspace(self: &Arc<Self>, success: bool) {
        let queued = {
            let mut shared = self.lock();
            if !success {
                shared.keyspace.clear();
            }
            shared.use_keyspace_stream = -1;
            std::mem::take(&mut shared.queued)
        };
        for item in queued {
            self.dispatch(&item.frame, item.body);
        }
        self.resume.notify_one();
    }

    /// Tick handler: hand this client's batches to its writer.
    pub fn wake_writer(&self) {
        self.write_wake.notify_one();
    }
}

/// Decode the skip-metadata bit from the flags byte that follows the
/// consistency level in QUERY and EXECUTE bodies. Anything short defaults
/// to full metadata.
fn skip_metadata(rest: &[u8]) -> bool {
    let Ok((_consistency, rest)) = read_uint16(rest) else {
        return false;
    };
    let Ok((flags, _)) = read_uint8(rest) else {
        return false;
    };
    QueryFlags::from_bits_truncate(flags).contains(QueryFlags::SKIP_METADATA)
}

/// Frame-decoder sink that validates headers and dispatches complete frames.
struct ClientSink {
    client: Arc<Client>,
    frame: FrameInfo,
    body: BytesMut,
}

impl ClientSink {
    fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            frame: FrameInfo::default(),
            body: BytesMut::new(),
        }
    }

    fn fail(&self, message: &'static str) -> Error {
        self.client
            .write_error(self.frame.stream, error_code::PROTOCOL_ERROR, message);
        self.client.close();
        Error::Protocol(message)
    }
}

impl FrameSink for ClientSink {
    fn header_done(&mut self, header: &FrameInfo) -> Result<()> {
        if self.client.is_closing() {
            return Err(Error::Protocol("client is closing"));
        }
        self.frame = *header;
        if header.version < PROTOCOL_VERSION_MIN || header.version > PROTOCOL_VERSION_MAX {
            return Err(self.fail("Invalid or unsupported protocol version"));
        }
        if header.length < 0 {
            return Err(self.fail("Frame length is invalid"));
        }
        if header.length > MAX_FRAME_SIZE {
            return Err(self.fail("Frame body is too big"));
        }
        self.body.clear();
        self.body
            .reserve((header.length as usize).min(MAX_BODY_INLINE));
        Ok(())
    }

    fn body_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn body_done(&mut self) -> Result<()> {
        let body = self.body.split().freeze();
        self.client.dispatch(&self.frame, body);
        Ok(())
    }
}

/// Read loop: decode frames until EOF, error, or close; suspend while a
/// keyspace connect is pending.
pub async fn run_reader(client: Arc<Client>, mut read_half: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let mut sink = ClientSink::new(Arc::clone(&client));
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        {
            let resumed = client.resume.notified();
            if client.is_closing() {
                break;
            }
            if client.reads_paused() {
                resumed.await;
                continue;
            }
        }

        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if decoder.decode(&buf[..n], &mut sink).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(client = %client.peer, error = %err, "read failed");
                break;
            }
        }
    }
    client.close();
    debug!(client = %client.peer, "client disconnected");
}

/// Write loop: drain batches when the tick signals, one scatter-gather write
/// per batch; shut the socket down once closing and fully drained.
pub async fn run_writer(client: Arc<Client>, mut write_half: OwnedWriteHalf) {
    loop {
        let woken = client.write_wake.notified();
        let (batches, closing) = client.take_batches();
        if batches.is_empty() {
            if closing {
                break;
            }
            woken.await;
            continue;
        }
        for batch in &batches {
            if batch.is_empty() {
                continue;
            }
            let mut slices = batch.io_slices();
            if let Err(err) = write_all_vectored(&mut write_half, &mut slices).await {
                debug!(client = %client.peer, error = %err, "write failed");
                client.close();
                return;
            }
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
}
