use crate::peer::Direction;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// One live connection as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The peer's announced id, or its socket address if it sent none.
    pub peer_id: String,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub connected_at: Instant,
}

/// Live connections keyed by a per-node connection number.
///
/// Two nodes that dial each other end up with two connections under the
/// same peer id, so the id alone is not a key.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    connections: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn insert(&self, info: ConnectionInfo) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, info);
        id
    }

    pub fn remove(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.remove(&id).map(|(_, info)| info)
    }

    pub fn contains_peer(&self, peer_id: &str) -> bool {
        self.connections.iter().any(|entry| entry.peer_id == peer_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Oldest connection first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut entries: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|info| info.connected_at);
        entries
    }
}
