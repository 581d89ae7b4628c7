//! Identifiers for calcgrid entities.
//!
//! Graph nodes are addressed by their arena index. Processes and workers
//! are UUIDs. Jobs carry a monotonically assigned counter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node identifier - index of a node in its graph arena.
///
/// Nodes are numbered in insertion order, so the natural ordering of
/// `NodeId` is also the deterministic tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Create from a raw index
    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Create from an arena position, if it fits in 32 bits
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Self)
    }

    /// Get the arena position
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Process identifier - identifies the process that owns a set of jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Create a new random ProcessId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from name (stable across restarts)
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc_{}", self.0)
    }
}

/// Worker identifier - identifies a remote worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Create a new random WorkerId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

/// Job identifier - unique and monotonically increasing within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_index() {
        let id = NodeId::from_index(7).unwrap();
        assert_eq!(id.index(), 7);
        assert_eq!(id, NodeId::from_raw(7));
        assert_eq!(id.to_string(), "N7");
    }

    #[test]
    fn test_node_id_ord_follows_insertion() {
        assert!(NodeId::from_raw(1) < NodeId::from_raw(2));
    }

    #[test]
    fn test_process_id_from_name() {
        let a = ProcessId::from_name("desk-a");
        assert_eq!(a, ProcessId::from_name("desk-a"));
        assert_ne!(a, ProcessId::from_name("desk-b"));
        assert!(a.to_string().starts_with("proc_"));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(ProcessId::new(), ProcessId::new());
        assert_ne!(WorkerId::new(), WorkerId::new());
    }

    #[test]
    fn test_job_id_serializes_as_number() {
        let json = serde_json::to_string(&JobId::from_raw(42)).unwrap();
        assert_eq!(json, "42");
    }
}
