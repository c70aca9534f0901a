//! Core type definitions for pipewrite
//!
//! This module defines the identifiers and descriptors shared by the key
//! write path, the control plane that hands out blocks, and the metadata
//! service that records the final key layout.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a storage node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a replication pipeline
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct PipelineId(Uuid);

impl PipelineId {
    /// Generate a new random pipeline ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineId({})", self.0)
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a storage container (a server-side group of blocks)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct ContainerId(u64);

impl ContainerId {
    /// Create a container ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of a block: the owning container plus a container-local ID
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Container the block lives in
    pub container_id: ContainerId,
    /// Container-local block number
    pub local_id: u64,
}

impl BlockId {
    /// Create a new block ID
    #[must_use]
    pub const fn new(container_id: ContainerId, local_id: u64) -> Self {
        Self {
            container_id,
            local_id,
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}:{})", self.container_id, self.local_id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container_id, self.local_id)
    }
}

/// Name of the key being written
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct KeyName(String);

impl KeyName {
    /// Create a new key name
    pub fn new(name: impl Into<String>) -> Result<Self, KeyNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the key name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), KeyNameError> {
        if name.is_empty() {
            return Err(KeyNameError::Empty);
        }
        if name.len() > 1024 {
            return Err(KeyNameError::TooLong);
        }
        Ok(())
    }
}

impl fmt::Debug for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyName({:?})", self.0)
    }
}

/// Errors that can occur when creating a key name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyNameError {
    #[error("key name cannot be empty")]
    Empty,
    #[error("key name cannot exceed 1024 bytes")]
    TooLong,
}

/// Number of replicas a pipeline keeps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationFactor {
    /// Single copy, no redundancy
    One,
    /// Three-way replication
    #[default]
    Three,
}

impl ReplicationFactor {
    /// Number of nodes in a pipeline of this factor
    #[must_use]
    pub const fn node_count(self) -> usize {
        match self {
            Self::One => 1,
            Self::Three => 3,
        }
    }
}

impl fmt::Display for ReplicationFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => write!(f, "ONE"),
            Self::Three => write!(f, "THREE"),
        }
    }
}

/// Ordered group of storage nodes that replicates the blocks it serves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline identifier
    pub id: PipelineId,
    /// Member nodes; the first one leads the pipeline
    pub nodes: Vec<NodeId>,
    /// Replication factor
    pub replication: ReplicationFactor,
}

impl Pipeline {
    /// Create a pipeline
    #[must_use]
    pub fn new(id: PipelineId, nodes: Vec<NodeId>, replication: ReplicationFactor) -> Self {
        Self {
            id,
            nodes,
            replication,
        }
    }

    /// Number of members that must acknowledge a write
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Whether `node` is a member of this pipeline
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// Keep only the members of this pipeline, preserving pipeline order
    #[must_use]
    pub fn members_of<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) -> Vec<NodeId> {
        let wanted: BTreeSet<NodeId> = nodes.into_iter().copied().collect();
        self.nodes
            .iter()
            .filter(|n| wanted.contains(n))
            .copied()
            .collect()
    }

    /// Whether a quorum survives once `lost` members are unreachable
    #[must_use]
    pub fn has_quorum_without(&self, lost: &[NodeId]) -> bool {
        let alive = self.nodes.iter().filter(|n| !lost.contains(n)).count();
        alive >= self.quorum()
    }
}

/// A block handed out by the control plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedBlock {
    /// Block identifier (carries the container)
    pub block_id: BlockId,
    /// Pipeline that replicates the block
    pub pipeline: Pipeline,
    /// Maximum number of bytes the block accepts
    pub capacity: u64,
}

impl AllocatedBlock {
    /// Container owning the block
    #[must_use]
    pub const fn container_id(&self) -> ContainerId {
        self.block_id.container_id
    }
}

/// Committed location of part of a key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Block identifier
    pub block_id: BlockId,
    /// Pipeline the block was written through
    pub pipeline_id: PipelineId,
    /// Offset of the block's first byte within the key
    pub offset: u64,
    /// Committed length of the block
    pub length: u64,
}

impl BlockDescriptor {
    /// Container owning the block
    #[must_use]
    pub const fn container_id(&self) -> ContainerId {
        self.block_id.container_id
    }
}

/// Point-in-time copy of a key's exclusions, sent with every allocation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeSnapshot {
    /// Containers that must not be used
    pub containers: BTreeSet<ContainerId>,
    /// Pipelines that must not be used
    pub pipelines: BTreeSet<PipelineId>,
    /// Nodes that must not be members of a chosen pipeline
    pub nodes: BTreeSet<NodeId>,
}

impl ExcludeSnapshot {
    /// True when nothing is excluded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.pipelines.is_empty() && self.nodes.is_empty()
    }

    /// Whether the pipeline itself or any of its members is excluded
    #[must_use]
    pub fn excludes_pipeline(&self, pipeline: &Pipeline) -> bool {
        self.pipelines.contains(&pipeline.id) || pipeline.nodes.iter().any(|n| self.nodes.contains(n))
    }

    /// Whether an allocated block conflicts with these exclusions
    #[must_use]
    pub fn excludes_block(&self, block: &AllocatedBlock) -> bool {
        self.containers.contains(&block.container_id()) || self.excludes_pipeline(&block.pipeline)
    }
}
