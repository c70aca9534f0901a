//! In-memory storage node

use parking_lot::RwLock;
use pipewrite_common::{BlockId, NodeId};
use pipewrite_placement::NodeInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A storage node holding one replica per block it has seen
///
/// A shut-down node keeps its replicas but takes no writes. A node that
/// missed part of a block cannot extend that replica afterwards.
pub struct Datanode {
    info: NodeInfo,
    up: AtomicBool,
    replicas: RwLock<HashMap<BlockId, Vec<u8>>>,
}

impl Datanode {
    /// Create a running node
    #[must_use]
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            up: AtomicBool::new(true),
            replicas: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.info.id
    }

    #[must_use]
    pub const fn info(&self) -> &NodeInfo {
        &self.info
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.up.store(false, Ordering::Release);
    }

    pub fn restart(&self) {
        self.up.store(true, Ordering::Release);
    }

    /// Apply a chunk at `offset`; returns whether the replica accepted it
    ///
    /// Writing at or below the replica's end replaces everything from
    /// `offset` on. Writing past the end would leave a hole and is refused.
    pub fn write(&self, block: BlockId, offset: u64, data: &[u8]) -> bool {
        if !self.is_up() {
            return false;
        }
        let mut replicas = self.replicas.write();
        let replica = replicas.entry(block).or_default();
        let Ok(offset) = usize::try_from(offset) else {
            return false;
        };
        if offset > replica.len() {
            return false;
        }
        replica.truncate(offset);
        replica.extend_from_slice(data);
        true
    }

    /// Length of the replica for `block`
    #[must_use]
    pub fn replica_len(&self, block: BlockId) -> u64 {
        self.replicas
            .read()
            .get(&block)
            .map_or(0, |r| r.len() as u64)
    }

    /// Read `[0, len)` of the replica, if the replica is that long
    #[must_use]
    pub fn read(&self, block: BlockId, len: u64) -> Option<Vec<u8>> {
        let len = usize::try_from(len).ok()?;
        let replicas = self.replicas.read();
        let replica = replicas.get(&block)?;
        replica.get(..len).map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewrite_common::ContainerId;
    use pipewrite_placement::NodeStatus;

    fn node() -> Datanode {
        Datanode::new(NodeInfo {
            id: NodeId::new(),
            name: "dn0".into(),
            status: NodeStatus::Active,
            weight: 1.0,
        })
    }

    #[test]
    fn test_replica_rewrite_and_holes() {
        let node = node();
        let block = BlockId::new(ContainerId::new(1), 1);
        assert!(node.write(block, 0, b"hello"));
        assert!(node.write(block, 5, b" world"));
        assert_eq!(node.replica_len(block), 11);

        // Rewrite from the middle
        assert!(node.write(block, 5, b"!"));
        assert_eq!(node.read(block, 6).unwrap(), b"hello!");

        assert!(!node.write(block, 10, b"gap"));
        assert!(node.read(block, 7).is_none());
    }

    #[test]
    fn test_down_node_refuses_writes() {
        let node = node();
        let block = BlockId::new(ContainerId::new(1), 1);
        node.shutdown();
        assert!(!node.write(block, 0, b"x"));
        node.restart();
        assert!(node.write(block, 0, b"x"));
    }
}
