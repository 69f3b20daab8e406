//! Tracks the workers this process can reach.
//!
//! The [`WorkerRegistry`] is a thread-safe map from worker name to address
//! and connection state. It is seeded from the configured peers; the
//! transport updates connection state as connections come and go.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tandem_types::config::PeerConfig;
use tandem_types::ids::{WorkerId, WorkerInfo};

/// Connection state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Known from configuration, never connected.
    Known,
    /// Handshake completed, fully connected.
    Connected,
    /// Connection lost; the next call reconnects.
    Disconnected,
}

/// An entry representing a single known worker.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub info: WorkerInfo,
    /// Address the worker listens on.
    pub address: SocketAddr,
    pub state: WorkerState,
    /// When the current (or last) connection was established.
    pub connected_at: Option<DateTime<Utc>>,
}

impl WorkerEntry {
    pub fn new(info: WorkerInfo, address: SocketAddr) -> Self {
        Self {
            info,
            address,
            state: WorkerState::Known,
            connected_at: None,
        }
    }
}

impl From<&PeerConfig> for WorkerEntry {
    fn from(peer: &PeerConfig) -> Self {
        Self::new(peer.worker_info(), peer.addr)
    }
}

/// Thread-safe registry of known workers, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
}

impl WorkerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the configured peers.
    pub fn from_peers(peers: &[PeerConfig]) -> Self {
        let registry = Self::new();
        for peer in peers {
            registry.add_worker(WorkerEntry::from(peer));
        }
        registry
    }

    /// Register or replace a worker.
    pub fn add_worker(&self, entry: WorkerEntry) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.insert(entry.info.name.clone(), entry);
    }

    /// Remove a worker entirely.
    pub fn remove_worker(&self, name: &str) -> Option<WorkerEntry> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.remove(name)
    }

    /// Get a snapshot of a specific worker.
    pub fn get_worker(&self, name: &str) -> Option<WorkerEntry> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.get(name).cloned()
    }

    /// Find a worker by id.
    pub fn get_by_id(&self, id: WorkerId) -> Option<WorkerEntry> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.values().find(|w| w.info.id == id).cloned()
    }

    /// Mark a worker as connected.
    pub fn mark_connected(&self, name: &str) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = workers.get_mut(name) {
            entry.state = WorkerState::Connected;
            entry.connected_at = Some(Utc::now());
        }
    }

    /// Mark a worker as disconnected (but keep its entry for reconnect).
    pub fn mark_disconnected(&self, name: &str) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = workers.get_mut(name) {
            entry.state = WorkerState::Disconnected;
        }
    }

    /// Get all workers, sorted by id.
    pub fn all_workers(&self) -> Vec<WorkerEntry> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = workers.values().cloned().collect();
        all.sort_by_key(|w| w.info.id);
        all
    }

    /// Number of connected workers.
    pub fn connected_count(&self) -> usize {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .values()
            .filter(|w| w.state == WorkerState::Connected)
            .count()
    }

    /// Total number of workers (in any state).
    pub fn total_count(&self) -> usize {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, id: u16, port: u16) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn test_seeded_from_peers() {
        let registry = WorkerRegistry::from_peers(&[peer("ps", 0, 7000), peer("trainer", 1, 7001)]);
        assert_eq!(registry.total_count(), 2);
        assert_eq!(registry.connected_count(), 0);

        let ps = registry.get_worker("ps").unwrap();
        assert_eq!(ps.state, WorkerState::Known);
        assert_eq!(ps.address.port(), 7000);
        assert_eq!(registry.get_by_id(WorkerId(1)).unwrap().info.name, "trainer");
        assert!(registry.get_by_id(WorkerId(9)).is_none());
    }

    #[test]
    fn test_disconnect_reconnect() {
        let registry = WorkerRegistry::from_peers(&[peer("ps", 0, 7000)]);
        registry.mark_connected("ps");
        assert_eq!(registry.connected_count(), 1);
        assert!(registry.get_worker("ps").unwrap().connected_at.is_some());

        registry.mark_disconnected("ps");
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_remove_and_order() {
        let registry = WorkerRegistry::from_peers(&[peer("b", 2, 1), peer("a", 1, 2)]);
        let ids: Vec<_> = registry.all_workers().iter().map(|w| w.info.id).collect();
        assert_eq!(ids, vec![WorkerId(1), WorkerId(2)]);
        assert!(registry.remove_worker("a").is_some());
        assert_eq!(registry.total_count(), 1);
    }
}
