//! Registry of active receiver connections.
//!
//! Each accepted connection gets a slab slot holding its own
//! `TransferSession`. The slot index doubles as the connection id in logs.
//! Removing the entry releases the session.

use crate::session::TransferSession;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// A live connection and its session
#[derive(Debug)]
pub struct ConnectionEntry {
    pub peer: SocketAddr,
    pub opened_at: Instant,
    pub session: Arc<TransferSession>,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Slab<ConnectionEntry>,
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

    /// Register a connection with a fresh session.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn open(
        &mut self,
        peer: SocketAddr,
        expected_total_bytes: u64,
    ) -> Option<(usize, Arc<TransferSession>)> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let session = Arc::new(TransferSession::new(expected_total_bytes));
        let id = self.connections.insert(ConnectionEntry {
            peer,
            opened_at: Instant::now(),
            session: Arc::clone(&session),
        });
        Some((id, session))
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&ConnectionEntry> {
        self.connections.get(id)
    }

    /// Remove a connection from the registry, resetting its session.
    pub fn close(&mut self, id: usize) -> Option<ConnectionEntry> {
        let entry = self.connections.try_remove(id)?;
        entry.session.reset();
        Some(entry)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all active connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ConnectionEntry)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_sessions_are_per_connection() {
        let mut registry = ConnectionRegistry::new(2);

        let (id1, s1) = registry.open(peer(1000), 100).unwrap();
        let (id2, s2) = registry.open(peer(1001), 100).unwrap();

        // At capacity
        assert!(registry.open(peer(1002), 100).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);

        s1.start(Instant::now());
        s1.record(40);
        s2.record(7);
        assert_eq!(registry.get(id1).unwrap().session.snapshot().bytes_transferred, 40);
        assert_eq!(registry.get(id2).unwrap().session.snapshot().bytes_transferred, 7);
        assert_eq!(registry.get(id2).unwrap().peer, peer(1001));

        let entry = registry.close(id1).unwrap();
        assert!(entry.session.is_pristine());
        assert!(s1.is_pristine());
        assert!(registry.get(id1).is_none());
        assert!(registry.close(id1).is_none());
        assert_eq!(registry.len(), 1);

        let active: Vec<usize> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(active, vec![id2]);
    }

    #[test]
    fn test_slot_reuse() {
        let mut registry = ConnectionRegistry::new(1);
        let (id, _) = registry.open(peer(1), 10).unwrap();
        registry.close(id);
        assert!(registry.is_empty());
        let (reused, session) = registry.open(peer(2), 10).unwrap();
        assert_eq!(reused, id);
        assert!(session.is_pristine());
    }
}
