//! Mini cluster assembly, fault injection and inspection

use crate::control::ControlPlane;
use crate::datanode::Datanode;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pipewrite_client::{
    AllocationRequest, BlockAllocator, ChunkWrite, CommitAck, KeyCommit, KeyMetadataService,
    ReplicationClient, WriteClients,
};
use pipewrite_common::{
    AllocatedBlock, AllocationError, BlockId, CommitError, ContainerId, NodeId, Pipeline,
    PipelineId, ReplicationFactor, ReplicationFailure,
};
use pipewrite_placement::{ClusterTopology, NodeInfo, NodeStatus, PipelineSelector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How many replicas a commit watch waits for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitWatch {
    /// A quorum of the pipeline
    #[default]
    Majority,
    /// Every member; members that lag are reported unavailable
    All,
}

/// Errors from cluster setup, fault injection and inspection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("invalid cluster layout: {0}")]
    InvalidLayout(String),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("block {0} has no readable replica")]
    BlockUnreadable(BlockId),
}

/// Builder for `MiniCluster`
#[derive(Clone, Debug)]
pub struct MiniClusterBuilder {
    nodes: usize,
    pipelines: Option<usize>,
    replication: ReplicationFactor,
    container_capacity: u64,
    commit_watch: CommitWatch,
}

impl Default for MiniClusterBuilder {
    fn default() -> Self {
        Self {
            nodes: 10,
            pipelines: None,
            replication: ReplicationFactor::Three,
            container_capacity: 5 * 1024 * 1024 * 1024,
            commit_watch: CommitWatch::Majority,
        }
    }
}

impl MiniClusterBuilder {
    /// Number of storage nodes (default: 10)
    #[must_use]
    pub const fn nodes(mut self, count: usize) -> Self {
        self.nodes = count;
        self
    }

    /// Number of pipelines (default: as many disjoint ones as fit)
    #[must_use]
    pub const fn pipelines(mut self, count: usize) -> Self {
        self.pipelines = Some(count);
        self
    }

    /// Replication factor of every pipeline (default: three)
    #[must_use]
    pub const fn replication(mut self, replication: ReplicationFactor) -> Self {
        self.replication = replication;
        self
    }

    /// Bytes of blocks a container takes before a new one is opened
    #[must_use]
    pub const fn container_capacity(mut self, bytes: u64) -> Self {
        self.container_capacity = bytes;
        self
    }

    /// Replicas a commit watch waits for
    #[must_use]
    pub const fn commit_watch(mut self, watch: CommitWatch) -> Self {
        self.commit_watch = watch;
        self
    }

    /// Build the cluster
    ///
    /// Pipeline `k` takes nodes `k*f .. k*f+f` (modulo the node count), so
    /// pipelines only share nodes when more are requested than fit.
    pub fn build(self) -> Result<Arc<MiniCluster>, ClusterError> {
        let factor = self.replication.node_count();
        if self.nodes < factor {
            return Err(ClusterError::InvalidLayout(format!(
                "{} nodes cannot form a {} pipeline",
                self.nodes, self.replication
            )));
        }
        let pipeline_count = self.pipelines.unwrap_or(self.nodes / factor);
        if pipeline_count == 0 {
            return Err(ClusterError::InvalidLayout("no pipelines".into()));
        }

        let mut topology = ClusterTopology::new();
        let mut datanodes = Vec::with_capacity(self.nodes);
        for i in 0..self.nodes {
            let info = NodeInfo {
                id: NodeId::new(),
                name: format!("dn{i}"),
                status: NodeStatus::Active,
                weight: 1.0,
            };
            topology.upsert_node(info.clone());
            datanodes.push(Arc::new(Datanode::new(info)));
        }

        let mut pipelines = Vec::with_capacity(pipeline_count);
        for k in 0..pipeline_count {
            let members = (0..factor)
                .map(|j| datanodes[(k * factor + j) % self.nodes].id())
                .collect();
            let pipeline = Pipeline::new(PipelineId::new(), members, self.replication);
            if !topology.add_pipeline(pipeline.clone()) {
                return Err(ClusterError::InvalidLayout(format!(
                    "pipeline {k} could not be registered"
                )));
            }
            pipelines.push(pipeline);
        }

        info!(
            nodes = self.nodes,
            pipelines = pipeline_count,
            replication = %self.replication,
            "mini cluster started"
        );

        let selector = PipelineSelector::new(Arc::new(RwLock::new(topology)));
        Ok(Arc::new(MiniCluster {
            datanodes: datanodes.into_iter().map(|d| (d.id(), d)).collect(),
            pipelines,
            control: ControlPlane::new(selector, self.container_capacity),
            commit_watch: self.commit_watch,
            keys: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            released: Mutex::new(HashSet::new()),
        }))
    }
}

#[derive(Default)]
struct Faults {
    transient: HashMap<BlockId, u32>,
    commit: Option<CommitError>,
}

/// In-memory cluster implementing every key writer collaborator
pub struct MiniCluster {
    datanodes: HashMap<NodeId, Arc<Datanode>>,
    pipelines: Vec<Pipeline>,
    control: ControlPlane,
    commit_watch: CommitWatch,
    keys: RwLock<HashMap<String, KeyCommit>>,
    faults: Mutex<Faults>,
    released: Mutex<HashSet<BlockId>>,
}

impl MiniCluster {
    /// Start building a cluster
    #[must_use]
    pub fn builder() -> MiniClusterBuilder {
        MiniClusterBuilder::default()
    }

    /// Collaborators for a `KeyWriter`, all backed by this cluster
    #[must_use]
    pub fn clients(self: &Arc<Self>) -> WriteClients {
        WriteClients {
            allocator: Arc::clone(self) as Arc<dyn BlockAllocator>,
            replication: Arc::clone(self) as Arc<dyn ReplicationClient>,
            metadata: Arc::clone(self) as Arc<dyn KeyMetadataService>,
        }
    }

    /// Every pipeline, in creation order
    #[must_use]
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    #[must_use]
    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// Pipeline hosting a container
    #[must_use]
    pub fn pipeline_of_container(&self, id: ContainerId) -> Option<&Pipeline> {
        self.control
            .pipeline_of_container(id)
            .and_then(|p| self.pipeline(p))
    }

    /// Stop a node. The control plane is not told.
    pub fn shutdown_node(&self, id: NodeId) -> Result<(), ClusterError> {
        let node = self.datanodes.get(&id).ok_or(ClusterError::UnknownNode(id))?;
        node.shutdown();
        warn!(node = %id, name = %node.info().name, "node shut down");
        Ok(())
    }

    /// Bring a stopped node back
    pub fn restart_node(&self, id: NodeId) -> Result<(), ClusterError> {
        let node = self.datanodes.get(&id).ok_or(ClusterError::UnknownNode(id))?;
        node.restart();
        info!(node = %id, name = %node.info().name, "node restarted");
        Ok(())
    }

    /// Close a container; further chunk writes to it fail
    pub fn close_container(&self, id: ContainerId) -> Result<(), ClusterError> {
        if self.control.close_container(id) {
            Ok(())
        } else {
            Err(ClusterError::UnknownContainer(id))
        }
    }

    /// Make the next `count` chunk writes to `block` fail transiently
    pub fn inject_transient_faults(&self, block: BlockId, count: u32) {
        *self.faults.lock().transient.entry(block).or_default() += count;
    }

    /// Make the next key commit fail with `error`
    pub fn fail_next_commit(&self, error: CommitError) {
        self.faults.lock().commit = Some(error);
    }

    /// Whether the writer released `block`
    #[must_use]
    pub fn is_released(&self, block: BlockId) -> bool {
        self.released.lock().contains(&block)
    }

    /// Committed layout of a key
    #[must_use]
    pub fn lookup_key(&self, key: &str) -> Option<KeyCommit> {
        self.keys.read().get(key).cloned()
    }

    /// Read a committed key back from the storage nodes
    ///
    /// Each block is read from the first member whose replica covers the
    /// committed length; running nodes are preferred.
    pub fn read_key(&self, key: &str) -> Result<Vec<u8>, ClusterError> {
        let commit = self
            .lookup_key(key)
            .ok_or_else(|| ClusterError::KeyNotFound(key.to_string()))?;

        let mut data = Vec::with_capacity(usize::try_from(commit.total_length).unwrap_or(0));
        for block in &commit.blocks {
            let pipeline = self
                .pipeline(block.pipeline_id)
                .ok_or(ClusterError::BlockUnreadable(block.block_id))?;
            let mut members: Vec<&Arc<Datanode>> = pipeline
                .nodes
                .iter()
                .filter_map(|n| self.datanodes.get(n))
                .collect();
            members.sort_by_key(|n| !n.is_up());

            let bytes = members
                .iter()
                .find_map(|n| n.read(block.block_id, block.length))
                .ok_or(ClusterError::BlockUnreadable(block.block_id))?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    fn members<'a>(&'a self, pipeline: &'a Pipeline) -> impl Iterator<Item = &'a Arc<Datanode>> {
        pipeline.nodes.iter().filter_map(|n| self.datanodes.get(n))
    }
}

#[async_trait]
impl BlockAllocator for MiniCluster {
    async fn allocate_block(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocatedBlock, AllocationError> {
        self.control.allocate_block(request).await
    }
}

#[async_trait]
impl ReplicationClient for MiniCluster {
    async fn write_chunk(&self, chunk: ChunkWrite) -> Result<(), ReplicationFailure> {
        let container = chunk.block_id.container_id;
        if self.control.is_container_closed(container) {
            return Err(ReplicationFailure::ContainerClosed { container });
        }

        {
            let mut faults = self.faults.lock();
            if let Some(remaining) = faults.transient.get_mut(&chunk.block_id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ReplicationFailure::transient("injected fault"));
            }
        }

        if !chunk.checksum.verify(&chunk.data) {
            return Err(ReplicationFailure::transient(format!(
                "checksum mismatch at {}:{}",
                chunk.block_id, chunk.offset
            )));
        }

        let mut stored = 0;
        for node in self.members(&chunk.pipeline) {
            if node.write(chunk.block_id, chunk.offset, &chunk.data) {
                stored += 1;
            }
        }
        if stored == 0 {
            return Err(ReplicationFailure::PipelineFailed {
                pipeline: chunk.pipeline.id,
                unreachable: Vec::new(),
            });
        }

        debug!(
            block = %chunk.block_id,
            offset = chunk.offset,
            len = chunk.data.len(),
            replicas = stored,
            "stored chunk"
        );
        Ok(())
    }

    async fn watch_for_commit(
        &self,
        block_id: BlockId,
        pipeline: &Pipeline,
        offset: u64,
    ) -> Result<CommitAck, ReplicationFailure> {
        let (committed, lagging): (Vec<&Arc<Datanode>>, Vec<&Arc<Datanode>>) = self
            .members(pipeline)
            .partition(|n| n.is_up() && n.replica_len(block_id) >= offset);

        let enough = match self.commit_watch {
            CommitWatch::Majority => committed.len() >= pipeline.quorum(),
            CommitWatch::All => lagging.is_empty(),
        };
        if enough {
            return Ok(CommitAck { ack_offset: offset });
        }

        if self.commit_watch == CommitWatch::All && committed.len() >= pipeline.quorum() {
            return Err(ReplicationFailure::NodeUnavailable {
                nodes: lagging.iter().map(|n| n.id()).collect(),
            });
        }
        // Quorum loss: the replication layer cannot say which members are gone
        Err(ReplicationFailure::PipelineFailed {
            pipeline: pipeline.id,
            unreachable: Vec::new(),
        })
    }

    async fn release(&self, block_id: BlockId) {
        self.released.lock().insert(block_id);
    }
}

#[async_trait]
impl KeyMetadataService for MiniCluster {
    async fn commit_key(&self, commit: KeyCommit) -> Result<(), CommitError> {
        if let Some(error) = self.faults.lock().commit.take() {
            return Err(error);
        }
        for block in &commit.blocks {
            if self.control.block_capacity(block.block_id).is_none() {
                return Err(CommitError::UnknownBlock {
                    block: block.block_id,
                });
            }
        }

        info!(
            key = %commit.key,
            blocks = commit.blocks.len(),
            length = commit.total_length,
            "key committed"
        );
        self.keys
            .write()
            .insert(commit.key.as_str().to_string(), commit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewrite_client::KeyWriter;
    use pipewrite_common::{ClientConfig, ExcludeSnapshot, KeyName};

    fn request(key: &str, exclude: ExcludeSnapshot) -> AllocationRequest {
        AllocationRequest {
            key: KeyName::new(key).unwrap(),
            size_hint: 4096,
            replication: ReplicationFactor::Three,
            exclude,
        }
    }

    #[test]
    fn test_builder_layout() {
        let cluster = MiniCluster::builder().nodes(10).build().unwrap();
        assert_eq!(cluster.pipelines().len(), 3);
        let mut seen = HashSet::new();
        for pipeline in cluster.pipelines() {
            for node in &pipeline.nodes {
                assert!(seen.insert(*node), "pipelines overlap");
            }
        }

        assert!(MiniCluster::builder().nodes(2).build().is_err());
        assert!(MiniCluster::builder().nodes(3).pipelines(0).build().is_err());
    }

    #[tokio::test]
    async fn test_allocation_honours_exclusions() {
        let cluster = MiniCluster::builder().nodes(9).build().unwrap();
        let first = cluster
            .allocate_block(request("k", ExcludeSnapshot::default()))
            .await
            .unwrap();

        let mut exclude = ExcludeSnapshot::default();
        exclude.containers.insert(first.container_id());
        let same_pipeline = cluster.allocate_block(request("k", exclude)).await.unwrap();
        assert_eq!(same_pipeline.pipeline.id, first.pipeline.id);
        assert_ne!(same_pipeline.container_id(), first.container_id());

        let mut exclude = ExcludeSnapshot::default();
        exclude.nodes.insert(first.pipeline.nodes[0]);
        let moved = cluster.allocate_block(request("k", exclude)).await.unwrap();
        assert_ne!(moved.pipeline.id, first.pipeline.id);

        let mut exclude = ExcludeSnapshot::default();
        exclude.pipelines.extend(cluster.pipelines().iter().map(|p| p.id));
        let err = cluster.allocate_block(request("k", exclude)).await.unwrap_err();
        assert!(matches!(err, AllocationError::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_full_container_rolls_over() {
        let cluster = MiniCluster::builder()
            .nodes(3)
            .container_capacity(8192)
            .build()
            .unwrap();
        let mut containers = HashSet::new();
        for _ in 0..4 {
            let block = cluster
                .allocate_block(request("k", ExcludeSnapshot::default()))
                .await
                .unwrap();
            containers.insert(block.container_id());
        }
        assert_eq!(containers.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_watch_modes() {
        for (watch, expect_nodes) in [(CommitWatch::Majority, false), (CommitWatch::All, true)] {
            let cluster = MiniCluster::builder()
                .nodes(3)
                .commit_watch(watch)
                .build()
                .unwrap();
            let block = cluster
                .allocate_block(request("k", ExcludeSnapshot::default()))
                .await
                .unwrap();
            let pipeline = block.pipeline.clone();
            cluster.shutdown_node(pipeline.nodes[2]).unwrap();

            let data = bytes::Bytes::from_static(b"0123456789");
            let checksum = pipewrite_common::ChunkChecksum::compute(
                pipewrite_common::ChecksumType::Crc32c,
                4,
                &data,
            );
            cluster
                .write_chunk(ChunkWrite {
                    block_id: block.block_id,
                    pipeline: pipeline.clone(),
                    offset: 0,
                    data,
                    checksum,
                })
                .await
                .unwrap();

            let result = cluster.watch_for_commit(block.block_id, &pipeline, 10).await;
            if expect_nodes {
                assert_eq!(
                    result.unwrap_err(),
                    ReplicationFailure::NodeUnavailable {
                        nodes: vec![pipeline.nodes[2]]
                    }
                );
            } else {
                assert_eq!(result.unwrap(), CommitAck { ack_offset: 10 });
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_block_commit_rejected() {
        let cluster = MiniCluster::builder().nodes(3).build().unwrap();
        let mut writer = KeyWriter::open(
            KeyName::new("k").unwrap(),
            0,
            ClientConfig::default(),
            cluster.clients(),
        )
        .await
        .unwrap();
        writer.write(b"abc").await.unwrap();
        writer.close().await.unwrap();

        let mut commit = cluster.lookup_key("k").unwrap();
        commit.blocks[0].block_id = BlockId::new(ContainerId::new(999), 1);
        let err = cluster.commit_key(commit).await.unwrap_err();
        assert!(matches!(err, CommitError::UnknownBlock { .. }));
        assert_eq!(cluster.read_key("k").unwrap(), b"abc");
    }
}
