//! Client connection handles and the registry the event loop waits on.
//!
//! The registry is the watch set: a client stream is registered with the
//! poll if and only if it occupies a registry slot. Slab keys double as
//! poll tokens, so lookup on readiness is O(1) and a key can never appear
//! twice.

use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// An admitted client connection: the byte stream plus its remote address.
#[derive(Debug)]
pub struct ClientConnection {
    /// Non-blocking stream registered with the poll.
    pub stream: TcpStream,
    /// Remote address captured at accept time.
    pub peer: SocketAddr,
}

impl ClientConnection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }
}

/// Registry of admitted connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Capacity comes
/// from configuration rather than any readiness-primitive constant.
pub struct ConnectionRegistry {
    connections: Slab<ClientConnection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: ClientConnection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&ClientConnection> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut ClientConnection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    ///
    /// Removing an id that is not present is a no-op returning `None`.
    pub fn remove(&mut self, id: usize) -> Option<ClientConnection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientConnection)> {
        self.connections.iter()
    }
}
