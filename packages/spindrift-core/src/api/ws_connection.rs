//! WebSocket connection tracking and fan-out.
//!
//! This module provides tracking of WebSocket connections with broadcast
//! and force-close capability:
//!
//! - `WsConnectionManager`: tracks active connections and fans messages out
//! - `ConnectionGuard`: RAII guard for automatic cleanup on disconnect

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per connection; a client this far behind is dead.
const OUTBOUND_QUEUE: usize = 64;

/// Per-connection state: the outbound message queue.
struct ConnectionState {
    outbound: mpsc::Sender<String>,
}

/// Manages all active WebSocket connections.
///
/// Thread-safe and designed for concurrent access from multiple WebSocket
/// handlers. Uses hierarchical cancellation tokens for efficient
/// force-close of all connections.
pub struct WsConnectionManager {
    /// Active connections: connection_id -> state.
    connections: DashMap<String, ConnectionState>,
    /// Counter for generating unique connection IDs.
    next_id: AtomicU64,
    /// Global cancellation token - when cancelled, all connections close.
    /// Wrapped in RwLock so it can be replaced after close_all().
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    /// Creates a new connection manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection, returning its guard and outbound queue.
    ///
    /// The `ConnectionGuard` unregisters the connection when dropped; the
    /// receiver is the handler's half of the outbound message queue.
    pub fn register(self: &Arc<Self>) -> (ConnectionGuard, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{id}");
        let cancel_token = self.global_cancel.read().child_token();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);

        self.connections
            .insert(conn_id.clone(), ConnectionState { outbound });
        log::info!(
            "[WS] Connection registered: {} (total: {})",
            conn_id,
            self.connections.len()
        );

        (
            ConnectionGuard {
                id: conn_id,
                manager: Arc::clone(self),
                cancel_token,
            },
            rx,
        )
    }

    /// Unregisters a connection by ID.
    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] Connection unregistered: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Returns the number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queues `message` to every connection, reaping the unreachable.
    pub async fn broadcast(&self, message: String) {
        let mut dead: Vec<String> = Vec::new();
        for entry in self.connections.iter() {
            // try_send: a full queue means the client stopped reading; do
            // not let one stuck socket stall the broadcast cadence.
            if entry.value().outbound.try_send(message.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            log::warn!("[WS] Dropping unresponsive connection {id}");
            self.unregister(&id);
        }
    }

    /// Force-closes all connections.
    ///
    /// Cancels the global token, signalling every handler to terminate
    /// gracefully; a fresh token replaces it so new connections can still
    /// be accepted. Returns the number of connections signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {count} connection(s)");
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
///
/// This ensures connections are always cleaned up, even if the handler
/// panics or exits early.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    /// Token for this specific connection - cancelled on force-close.
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// Returns the connection ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the cancellation token for this connection.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}
