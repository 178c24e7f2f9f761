//! Idle persistent connections keyed by remote host and port.

use std::collections::HashMap;

use tracing::debug;

use super::{Connection, PeerAddr};

/// Idle connections kept per `host:port` unless configured otherwise.
pub const DEFAULT_MAX_IDLE_PER_PEER: usize = 8;

/// Pool of idle keep-alive connections.
///
/// Insert-on-return and remove-on-borrow: a pooled connection is owned by
/// the pool alone until [`take`](Self::take) hands it to exactly one command.
/// At most `max_idle_per_peer` connections are kept per peer; returning one
/// more closes the oldest.
#[derive(Debug)]
pub struct SocketPool {
    idle: HashMap<PeerAddr, Vec<Box<dyn Connection>>>,
    max_idle_per_peer: usize,
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::with_max_idle_per_peer(DEFAULT_MAX_IDLE_PER_PEER)
    }
}

impl SocketPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pool keeping at most `max` idle connections per peer.
    ///
    /// A limit of 0 disables pooling.
    #[must_use]
    pub fn with_max_idle_per_peer(max: usize) -> Self {
        Self {
            idle: HashMap::new(),
            max_idle_per_peer: max,
        }
    }

    /// Returns a connection to the pool under `host:port`.
    pub fn pool(&mut self, host: &str, port: u16, connection: Box<dyn Connection>) {
        if self.max_idle_per_peer == 0 {
            debug!(host, port, connection = connection.id(), "pooling disabled, closing connection");
            return;
        }
        debug!(host, port, connection = connection.id(), "pooling connection");
        let connections = self.idle.entry(PeerAddr::new(host, port)).or_default();
        if connections.len() >= self.max_idle_per_peer {
            let evicted = connections.remove(0);
            debug!(host, port, connection = evicted.id(), "idle limit reached, closing oldest");
        }
        connections.push(connection);
    }

    /// Borrows the most recently pooled connection for `host:port`.
    pub fn take(&mut self, host: &str, port: u16) -> Option<Box<dyn Connection>> {
        let key = PeerAddr::new(host, port);
        let connections = self.idle.get_mut(&key)?;
        let connection = connections.pop();
        if connections.is_empty() {
            self.idle.remove(&key);
        }
        if let Some(connection) = &connection {
            debug!(host, port, connection = connection.id(), "reusing pooled connection");
        }
        connection
    }

    /// Number of idle connections across all peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Whether no connection is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// Whether the connection with `id` is currently pooled.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.idle
            .values()
            .flatten()
            .any(|connection| connection.id() == id)
    }
}
