//! Per-connection backend socket pool
//!
//! Each client connection owns one pool, so there is no locking. A socket
//! is taken out of the pool for the duration of a request and only put back
//! after the whole round trip succeeded; a failed socket is simply never
//! returned, which evicts it.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::net::BackendStream;

/// Identifies a pooled socket: the owning client connection and the
/// resolved backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub connection: u64,
    pub server: SocketAddr,
}

pub struct SocketPool<S = BackendStream> {
    connection: u64,
    sockets: HashMap<PoolKey, S>,
}

impl<S> SocketPool<S> {
    pub fn new(connection: u64) -> Self {
        Self {
            connection,
            sockets: HashMap::new(),
        }
    }

    pub fn key(&self, server: SocketAddr) -> PoolKey {
        PoolKey {
            connection: self.connection,
            server,
        }
    }

    /// Removes and returns the socket for `server`, if one is pooled.
    pub fn take(&mut self, server: SocketAddr) -> Option<S> {
        let key = self.key(server);
        let socket = self.sockets.remove(&key);

        if socket.is_some() {
            tracing::debug!(%server, "Reusing pooled backend socket");
        } else {
            tracing::debug!(%server, "No pooled backend socket");
        }

        socket
    }

    /// Returns a socket after a successful round trip. Replaces (and closes)
    /// any socket already pooled for the same server.
    pub fn put(&mut self, server: SocketAddr, socket: S) {
        let key = self.key(server);
        tracing::trace!(%server, "Pooling backend socket");
        self.sockets.insert(key, socket);
    }

    /// Drops the socket for `server`. Returns whether one was pooled.
    pub fn evict(&mut self, server: SocketAddr) -> bool {
        let key = self.key(server);
        let evicted = self.sockets.remove(&key).is_some();

        if evicted {
            tracing::debug!(%server, "Evicted backend socket");
        }

        evicted
    }

    pub fn contains(&self, server: SocketAddr) -> bool {
        self.sockets.contains_key(&self.key(server))
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
