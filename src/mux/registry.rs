//! Handle registry for live connections and listeners.
//!
//! Ids are minted and retired in lock-step with socket lifecycle, so the
//! registry lives inside the multiplexer rather than as a separate service.
//! All access is serialized by the single mutex in
//! [`ConnectionManager`](super::ConnectionManager).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// A live connection: the shared stream plus the token that aborts any
/// in-flight operation when the handle is retired.
pub(super) struct ConnectionEntry {
    pub(super) stream: Arc<UnixStream>,
    pub(super) cancel: CancellationToken,
}

/// A live listener. The bound filesystem path is tracked separately in
/// `listener_endpoints` so it can be unlinked exactly once.
pub(super) struct ListenerEntry {
    pub(super) listener: Arc<UnixListener>,
    pub(super) cancel: CancellationToken,
}

/// Id maps for connections and listeners.
///
/// Connection and listener ids are independent spaces, both monotonically
/// increasing 32-bit integers starting at 0. Ids are never reused; wraparound
/// into negative space is reported as exhaustion because -1 is the reserved
/// invalid id.
pub(super) struct Registry {
    next_connection_id: i32,
    next_listener_id: i32,
    connections: HashMap<i32, ConnectionEntry>,
    listeners: HashMap<i32, ListenerEntry>,
    listener_endpoints: HashMap<i32, PathBuf>,
}

impl Registry {
    pub(super) fn new() -> Self {
        Self {
            next_connection_id: 0,
            next_listener_id: 0,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            listener_endpoints: HashMap::new(),
        }
    }

    /// Mint the next connection id, or `None` once the id space is exhausted.
    pub(super) fn allocate_connection_id(&mut self) -> Option<i32> {
        if self.next_connection_id < 0 {
            return None;
        }
        let id = self.next_connection_id;
        self.next_connection_id = id.wrapping_add(1);
        Some(id)
    }

    /// Mint the next listener id, or `None` once the id space is exhausted.
    pub(super) fn allocate_listener_id(&mut self) -> Option<i32> {
        if self.next_listener_id < 0 {
            return None;
        }
        let id = self.next_listener_id;
        self.next_listener_id = id.wrapping_add(1);
        Some(id)
    }

    pub(super) fn insert_connection(&mut self, connection_id: i32, stream: UnixStream) {
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                stream: Arc::new(stream),
                cancel: CancellationToken::new(),
            },
        );
    }

    /// Look up a connection, cloning the pieces an I/O task needs.
    pub(super) fn connection(
        &self,
        connection_id: i32,
    ) -> Option<(Arc<UnixStream>, CancellationToken)> {
        self.connections
            .get(&connection_id)
            .map(|entry| (Arc::clone(&entry.stream), entry.cancel.clone()))
    }

    pub(super) fn remove_connection(&mut self, connection_id: i32) -> Option<ConnectionEntry> {
        self.connections.remove(&connection_id)
    }

    pub(super) fn insert_listener(
        &mut self,
        listener_id: i32,
        listener: UnixListener,
        endpoint: PathBuf,
    ) {
        self.listeners.insert(
            listener_id,
            ListenerEntry {
                listener: Arc::new(listener),
                cancel: CancellationToken::new(),
            },
        );
        self.listener_endpoints.insert(listener_id, endpoint);
    }

    /// Look up a listener, cloning the pieces an accept task needs.
    pub(super) fn listener(
        &self,
        listener_id: i32,
    ) -> Option<(Arc<UnixListener>, CancellationToken)> {
        self.listeners
            .get(&listener_id)
            .map(|entry| (Arc::clone(&entry.listener), entry.cancel.clone()))
    }

    /// Remove a listener together with its endpoint path.
    ///
    /// A listener without a recorded endpoint means the registry is corrupt;
    /// that is an unrecoverable defect, not an error to report to callers.
    pub(super) fn remove_listener(
        &mut self,
        listener_id: i32,
    ) -> Option<(ListenerEntry, PathBuf)> {
        let entry = self.listeners.remove(&listener_id)?;
        let endpoint = self
            .listener_endpoints
            .remove(&listener_id)
            .unwrap_or_else(|| panic!("listener endpoint record missing for id {listener_id}"));
        Some((entry, endpoint))
    }

    /// Drop every listener and return their endpoint paths for unlinking.
    /// Used only during teardown.
    pub(super) fn drain_listener_endpoints(&mut self) -> Vec<PathBuf> {
        self.listeners.clear();
        self.listener_endpoints.drain().map(|(_, path)| path).collect()
    }

    /// Drop every remaining connection, closing the underlying sockets.
    pub(super) fn clear_connections(&mut self) {
        self.connections.clear();
    }

    /// Corrupt the registry by dropping an endpoint record while its
    /// listener stays live, to exercise the fatal invariant.
    #[cfg(test)]
    pub(super) fn forget_listener_endpoint(&mut self, listener_id: i32) {
        self.listener_endpoints.remove(&listener_id);
    }

    #[cfg(test)]
    pub(super) fn exhaust_connection_ids(&mut self) {
        self.next_connection_id = i32::MIN;
    }

    #[cfg(test)]
    pub(super) fn exhaust_listener_ids(&mut self) {
        self.next_listener_id = i32::MIN;
    }
}
