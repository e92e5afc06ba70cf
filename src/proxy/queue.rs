//! Cross-task client queues drained once per flush tick.

use std::sync::{Arc, Mutex};

use crate::constant::MAX_CLIENTS;
use crate::proxy::client::Client;

/// A dedup-by-identity queue of clients. Enqueueing the same client twice
/// between drains is a no-op, so a burst of responses costs one tick entry.
pub struct ClientQueue {
    clients: Mutex<Vec<Arc<Client>>>,
}

impl ClientQueue {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(MAX_CLIENTS)),
        }
    }

    /// Returns true when the client was newly added; the caller signals the
    /// tick wake handle only in that case.
    pub fn push(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.iter().any(|entry| Arc::ptr_eq(entry, client)) {
            return false;
        }
        clients.push(Arc::clone(client));
        true
    }

    pub fn drain(&self) -> Vec<Arc<Client>> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *clients)
    }
}

impl Default for ClientQueue {
    fn default() -> Self {
        Self::new()
    }
}
