//! Worker and reference identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u16);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// Name and id of a worker, as the transport addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Human-readable worker name (e.g. "trainer-0").
    pub name: String,
    /// Numeric worker id.
    pub id: WorkerId,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, id: WorkerId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id.0)
    }
}

/// An id that is unique across the cluster: the worker that minted it plus
/// a counter local to that worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GloballyUniqueId {
    /// Worker that minted the id.
    pub created_on: WorkerId,
    /// Sequence number local to `created_on`.
    pub local_id: u64,
}

impl GloballyUniqueId {
    pub fn new(created_on: WorkerId, local_id: u64) -> Self {
        Self {
            created_on,
            local_id,
        }
    }
}

impl fmt::Display for GloballyUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GloballyUniqueId({}, {})", self.created_on.0, self.local_id)
    }
}

/// Identifies a distributed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RRefId(pub GloballyUniqueId);

impl fmt::Display for RRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RRefId({}, {})", self.0.created_on.0, self.0.local_id)
    }
}

/// Identifies one outstanding copy (fork) of a distributed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForkId(pub GloballyUniqueId);

impl ForkId {
    /// Worker that created this fork.
    pub fn created_on(&self) -> WorkerId {
        self.0.created_on
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkId({}, {})", self.0.created_on.0, self.0.local_id)
    }
}
