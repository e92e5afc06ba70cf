//! The client-facing dataplane: per-connection state machines, response
//! batching, and the tick task that stitches them together.

pub mod batch;
pub mod client;
pub mod queue;
pub mod server;

use tokio::sync::Notify;

use crate::backend::{BackendOpts, BootInfo};
use crate::prepared::PreparedCache;
use crate::session::SessionRegistry;
use self::queue::ClientQueue;

/// Process-wide shared state. Everything a client or backend-completion task
/// touches hangs off one `Arc<Proxy>`.
pub struct Proxy {
    pub opts: BackendOpts,
    pub boot: BootInfo,
    pub prepared: PreparedCache,
    pub sessions: SessionRegistry,
    /// Clients with batches awaiting a flush.
    pub to_flush: ClientQueue,
    /// Clients whose pending keyspace connect resolved.
    pub use_keyspace_success: ClientQueue,
    pub use_keyspace_failed: ClientQueue,
    /// Wakes the tick task; the signal itself carries no data.
    pub wake: Notify,
}

impl Proxy {
    pub fn new(opts: BackendOpts, boot: BootInfo) -> Self {
        Self {
            opts,
            boot,
            prepared: PreparedCache::new(),
            sessions: SessionRegistry::new(),
            to_flush: ClientQueue::new(),
            use_keyspace_success: ClientQueue::new(),
            use_keyspace_failed: ClientQueue::new(),
            wake: Notify::new(),
        }
    }
}
