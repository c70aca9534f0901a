//! In-memory control plane: containers and block allocation

use async_trait::async_trait;
use parking_lot::Mutex;
use pipewrite_client::{AllocationRequest, BlockAllocator};
use pipewrite_common::{
    AllocatedBlock, AllocationError, BlockId, ContainerId, ExcludeSnapshot, PipelineId,
};
use pipewrite_placement::PipelineSelector;
use std::collections::HashMap;
use tracing::{debug, info};

/// Lifecycle of a container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Open,
    Closed,
}

#[derive(Clone, Debug)]
struct ContainerInfo {
    pipeline: PipelineId,
    state: ContainerState,
    allocated_bytes: u64,
    next_local_id: u64,
}

#[derive(Default)]
struct Containers {
    next_id: u64,
    containers: HashMap<ContainerId, ContainerInfo>,
    open_by_pipeline: HashMap<PipelineId, ContainerId>,
    blocks: HashMap<BlockId, u64>,
}

/// Allocates blocks in containers on pipelines chosen by HRW placement
pub struct ControlPlane {
    selector: PipelineSelector,
    container_capacity: u64,
    containers: Mutex<Containers>,
}

impl ControlPlane {
    /// Create a control plane over `selector`'s topology
    #[must_use]
    pub fn new(selector: PipelineSelector, container_capacity: u64) -> Self {
        Self {
            selector,
            container_capacity,
            containers: Mutex::new(Containers {
                next_id: 1,
                ..Containers::default()
            }),
        }
    }

    /// Close a container; returns `false` if it does not exist
    pub fn close_container(&self, id: ContainerId) -> bool {
        let mut containers = self.containers.lock();
        let Some(info) = containers.containers.get_mut(&id) else {
            return false;
        };
        info.state = ContainerState::Closed;
        let pipeline = info.pipeline;
        if containers.open_by_pipeline.get(&pipeline) == Some(&id) {
            containers.open_by_pipeline.remove(&pipeline);
        }
        info!(container = %id, "closed container");
        true
    }

    #[must_use]
    pub fn container_state(&self, id: ContainerId) -> Option<ContainerState> {
        self.containers.lock().containers.get(&id).map(|c| c.state)
    }

    #[must_use]
    pub fn is_container_closed(&self, id: ContainerId) -> bool {
        self.container_state(id) == Some(ContainerState::Closed)
    }

    /// Pipeline a container lives on
    #[must_use]
    pub fn pipeline_of_container(&self, id: ContainerId) -> Option<PipelineId> {
        self.containers.lock().containers.get(&id).map(|c| c.pipeline)
    }

    /// Capacity the block was allocated with, if it was allocated here
    #[must_use]
    pub fn block_capacity(&self, id: BlockId) -> Option<u64> {
        self.containers.lock().blocks.get(&id).copied()
    }

    /// Open container on `pipeline` that can take `size` more bytes and is
    /// not excluded, creating one if needed
    fn container_for(
        containers: &mut Containers,
        pipeline: PipelineId,
        size: u64,
        capacity: u64,
        exclude: &ExcludeSnapshot,
    ) -> ContainerId {
        if let Some(id) = containers.open_by_pipeline.get(&pipeline).copied() {
            let usable = containers.containers.get(&id).is_some_and(|c| {
                c.state == ContainerState::Open && c.allocated_bytes + size <= capacity
            });
            if usable && !exclude.containers.contains(&id) {
                return id;
            }
            if !usable {
                // Full: the control plane closes it and moves on
                if let Some(c) = containers.containers.get_mut(&id) {
                    c.state = ContainerState::Closed;
                }
            }
        }

        let id = ContainerId::new(containers.next_id);
        containers.next_id += 1;
        containers.containers.insert(
            id,
            ContainerInfo {
                pipeline,
                state: ContainerState::Open,
                allocated_bytes: 0,
                next_local_id: 1,
            },
        );
        containers.open_by_pipeline.insert(pipeline, id);
        debug!(container = %id, pipeline = %pipeline, "created container");
        id
    }
}

#[async_trait]
impl BlockAllocator for ControlPlane {
    async fn allocate_block(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocatedBlock, AllocationError> {
        let pipeline = self
            .selector
            .select(
                request.key.as_str().as_bytes(),
                request.replication,
                &request.exclude,
            )
            .map_err(|e| AllocationError::Exhausted(e.to_string()))?;

        let mut containers = self.containers.lock();
        let container = Self::container_for(
            &mut containers,
            pipeline.id,
            request.size_hint,
            self.container_capacity,
            &request.exclude,
        );
        let Some(info) = containers.containers.get_mut(&container) else {
            return Err(AllocationError::Unavailable(format!(
                "container {container} vanished"
            )));
        };
        let block_id = BlockId::new(container, info.next_local_id);
        info.next_local_id += 1;
        info.allocated_bytes += request.size_hint;
        containers.blocks.insert(block_id, request.size_hint);

        debug!(
            key = %request.key,
            block = %block_id,
            pipeline = %pipeline.id,
            "allocated block"
        );
        Ok(AllocatedBlock {
            block_id,
            pipeline,
            capacity: request.size_hint,
        })
    }
}
