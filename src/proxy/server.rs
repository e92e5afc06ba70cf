//! Backend bootstrap, accept loop, and the per-tick queue drain.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::backend::{BackendOpts, Conn};
use crate::error::Result;
use crate::proxy::client::{self, Client};
use crate::proxy::Proxy;

/// Connect the default session and learn the cluster facts the synthesizer
/// advertises. Failure here is fatal to startup.
pub async fn bootstrap(opts: BackendOpts) -> Result<Arc<Proxy>> {
    let mut conn = Conn::connect(&opts).await?;
    let boot = conn.boot_metadata().await?;
    info!(
        release_version = %boot.release_version,
        partitioner = %boot.partitioner,
        "connected to backend cluster"
    );

    let proxy = Arc::new(Proxy::new(opts, boot));
    proxy.sessions.default_session().check_in(conn);
    Ok(proxy)
}

/// Accept clients until the listener errors or the task is dropped.
pub async fn serve(listener: TcpListener, proxy: Arc<Proxy>) -> Result<()> {
    tokio::spawn(run_tick(Arc::clone(&proxy)));

    loop {
        let (socket, peer) = listener.accept().await?;
        let _ = socket.set_nodelay(true);
        debug!(%peer, "client connected");

        let (read_half, write_half) = socket.into_split();
        let client = Client::new(Arc::clone(&proxy), peer);
        tokio::spawn(client::run_reader(Arc::clone(&client), read_half));
        tokio::spawn(client::run_writer(client, write_half));
    }
}

/// Drain the cross-task queues once per wake: flush writers first, then
/// resolve failed and successful keyspace connects.
async fn run_tick(proxy: Arc<Proxy>) {
    loop {
        proxy.wake.notified().await;
        for client in proxy.to_flush.drain() {
            client.wake_writer();
        }
        for client in proxy.use_keyspace_failed.drain() {
            client.finish_use_keyspace(false);
        }
        for client in proxy.use_keyspace_success.drain() {
            client.finish_use_keyspace(true);
        }
    }
}
