//! Per-keyspace backend sessions, lazily connected.
//!
//! Each distinct keyspace gets one logical session multiplexing a small pool
//! of backend connections. The default (empty-keyspace) session is connected
//! at boot; the rest connect on first `USE`. Every client waiting on a
//! session's first connect parks on its wait-list and the whole list is
//! released together when the connect resolves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

use crate::backend::{BackendOpts, Conn, RawResult};
use crate::constant::error_code;
use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::proxy::client::Client;

/// Idle backend connections kept per session.
const POOL_SIZE: usize = 8;

type UseOutcome = std::result::Result<Conn, (i32, String)>;

pub struct Session {
    keyspace: String,
    connected: AtomicBool,
    conns: ArrayQueue<Conn>,
    waiters: Mutex<Vec<Arc<Client>>>,
}

impl Session {
    fn new(keyspace: String, connected: bool) -> Self {
        Self {
            keyspace,
            connected: AtomicBool::new(connected),
            conns: ArrayQueue::new(POOL_SIZE),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Return an idle connection to the pool; excess connections just drop.
    pub fn check_in(&self, conn: Conn) {
        let _ = self.conns.push(conn);
    }

    async fn check_out(&self, opts: &BackendOpts) -> Result<Conn> {
        if let Some(conn) = self.conns.pop() {
            return Ok(conn);
        }
        let mut conn = Conn::connect(opts).await?;
        if !self.keyspace.is_empty() {
            conn.use_keyspace(&self.keyspace).await?;
        }
        Ok(conn)
    }

    /// Round-trip one raw frame through a pooled connection. A connection
    /// that errors is dropped instead of returned to the pool.
    pub async fn execute_raw(
        &self,
        opts: &BackendOpts,
        opcode: u8,
        flags: u8,
        body: &[u8],
    ) -> Result<RawResult> {
        let mut conn = self.check_out(opts).await?;
        let result = conn.execute_raw(opcode, flags, body).await?;
        self.check_in(conn);
        Ok(result)
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// A fresh registry whose default session is already marked connected;
    /// the boot connection is checked into it by the caller.
    pub fn new() -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(
            String::new(),
            Arc::new(Session::new(String::new(), true)),
        );
        Self {
            sessions: Mutex::new(sessions),
        }
    }

    /// The existing entry for a keyspace, or a new unconnected one.
    pub fn get(&self, keyspace: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(keyspace) {
            return Arc::clone(session);
        }
        let session = Arc::new(Session::new(keyspace.to_string(), false));
        sessions.insert(keyspace.to_string(), Arc::clone(&session));
        session
    }

    pub fn find(&self, keyspace: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(keyspace).cloned()
    }

    pub fn default_session(&self) -> Arc<Session> {
        self.get("")
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Park a client on the session's wait-list and kick off the keyspace
/// connect if this is the first waiter. Completion writes each waiter's
/// reply frame and hands it to the proxy's tick via the cross-task queues.
pub fn connect_async(session: &Arc<Session>, proxy: &Arc<Proxy>, client: &Arc<Client>) {
    let first_waiter = {
        let mut waiters = session.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.push(Arc::clone(client));
        waiters.len() == 1
    };
    if !first_waiter {
        return;
    }

    let session = Arc::clone(session);
    let proxy = Arc::clone(proxy);
    tokio::spawn(async move {
        let outcome = connect_keyspace(&proxy.opts, session.keyspace()).await;
        let waiters =
            std::mem::take(&mut *session.waiters.lock().unwrap_or_else(|e| e.into_inner()));

        match outcome {
            Ok(conn) => {
                debug!(keyspace = session.keyspace(), "keyspace session connected");
                session.connected.store(true, Ordering::Release);
                session.check_in(conn);
                for client in waiters {
                    client.use_keyspace_connected(&proxy);
                }
            }
            Err((code, message)) => {
                warn!(
                    keyspace = session.keyspace(),
                    error = %message,
                    "keyspace connect failed"
                );
                for client in waiters {
                    client.use_keyspace_failed(&proxy, code, &message);
                }
            }
        }
    });
}

/// Connect and scope a fresh backend connection. A backend rejection of the
/// keyspace itself maps to `INVALID_QUERY`; everything earlier is the
/// proxy's problem and maps to `SERVER_ERROR`.
async fn connect_keyspace(opts: &BackendOpts, keyspace: &str) -> UseOutcome {
    let mut conn = Conn::connect(opts)
        .await
        .map_err(|err| (error_code::SERVER_ERROR, err.to_string()))?;
    match conn.use_keyspace(keyspace).await {
        Ok(()) => Ok(conn),
        Err(Error::Backend { message, .. }) => Err((error_code::INVALID_QUERY, message)),
        Err(err) => Err((error_code::SERVER_ERROR, err.to_string())),
    }
}
