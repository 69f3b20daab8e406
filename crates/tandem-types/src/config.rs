//! Worker configuration.

use crate::ids::{WorkerId, WorkerInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A statically known peer worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Worker name.
    pub name: String,
    /// Worker id.
    pub id: u16,
    /// Address the peer listens on.
    pub addr: SocketAddr,
}

impl PeerConfig {
    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo::new(self.name.clone(), WorkerId(self.id))
    }
}

/// Configuration of one tandem worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// This worker's name.
    pub worker_name: String,
    /// This worker's id. Must be unique in the cluster.
    pub worker_id: u16,
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Pre-shared key for HMAC-SHA256 connection authentication.
    pub shared_secret: String,
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Largest frame accepted from or sent to a peer.
    pub max_message_size: u32,
    /// Peers this worker can call.
    pub peers: Vec<PeerConfig>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker0".to_string(),
            worker_id: 0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared_secret: String::new(),
            log_level: "info".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            peers: Vec::new(),
        }
    }
}

impl RpcConfig {
    /// This worker's name and id.
    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo::new(self.worker_name.clone(), WorkerId(self.worker_id))
    }

    /// Find a configured peer by name.
    pub fn peer(&self, name: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.name == name)
    }
}
