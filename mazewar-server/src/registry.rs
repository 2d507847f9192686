//! The connection registry.
//!
//! Tracks every live session so a termination signal can wake all of them
//! and the bootstrap can wait for the drain. Each registered session gets a
//! shutdown [`Notify`]: its reader task stops reading when the notifier
//! fires, which the session observes like a peer disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Upper bound on simultaneously registered connections.
pub const MAX_CLIENTS: usize = 1024;

/// Identifies one registered connection.
pub type ConnectionId = u64;

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Arc<Notify>>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    empty: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            inner: Mutex::new(Inner::default()),
            empty: Notify::new(),
        }
    }

    /// Registers a connection and hands back its id and shutdown notifier.
    /// Returns `None` when [`MAX_CLIENTS`] connections are already live; the
    /// caller refuses the client.
    pub fn register(&self) -> Option<(ConnectionId, Arc<Notify>)> {
        let mut inner = self.inner.lock();
        if inner.connections.len() >= MAX_CLIENTS {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let shutdown = Arc::new(Notify::new());
        inner.connections.insert(id, shutdown.clone());
        tracing::debug!(connection = id, total = inner.connections.len(), "registered client");
        Some((id, shutdown))
    }

    /// Removes a connection. The last removal wakes every `wait_empty`
    /// caller.
    pub fn unregister(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if inner.connections.remove(&id).is_some() {
            tracing::debug!(connection = id, remaining = inner.connections.len(), "unregistered client");
            if inner.connections.is_empty() {
                self.empty.notify_waiters();
            }
        }
    }

    /// Number of currently registered connections.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Waits until no connection remains registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.empty.notified();
            if self.inner.lock().connections.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Fires every registered session's shutdown notifier. Sessions are not
    /// removed here, they unregister themselves on exit.
    pub fn shutdown_all(&self) {
        let inner = self.inner.lock();
        tracing::info!(connections = inner.connections.len(), "requesting shutdown of all sessions");
        for shutdown in inner.connections.values() {
            shutdown.notify_one();
        }
    }
}
