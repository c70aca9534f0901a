//! Block allocation
//!
//! `BlockAllocator` is the control plane's allocation RPC. The writer never
//! calls it directly: `BlockAllocationClient` snapshots the key's exclusions
//! into every request and refuses any reply that lands on an excluded
//! container, pipeline or node. Refused blocks are released.

use crate::exclude_list::ExcludeList;
use crate::replication::ReplicationClient;
use crate::stats::WriteStats;
use async_trait::async_trait;
use pipewrite_common::{
    AllocatedBlock, AllocationError, Error, ExcludeSnapshot, KeyName, ReplicationFactor, Result,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Request for one new block
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    /// Key the block is for
    pub key: KeyName,
    /// Expected number of bytes that will be written to the block
    pub size_hint: u64,
    /// Replication factor of the pipeline to use
    pub replication: ReplicationFactor,
    /// Targets the control plane must avoid
    pub exclude: ExcludeSnapshot,
}

/// Control-plane allocation service
#[async_trait]
pub trait BlockAllocator: Send + Sync {
    /// Allocate a block and pipeline that avoid `request.exclude`
    async fn allocate_block(
        &self,
        request: AllocationRequest,
    ) -> std::result::Result<AllocatedBlock, AllocationError>;
}

/// Exclusion-enforcing adapter over a `BlockAllocator`
pub struct BlockAllocationClient {
    allocator: Arc<dyn BlockAllocator>,
    storage: Arc<dyn ReplicationClient>,
    key: KeyName,
    replication: ReplicationFactor,
    max_attempts: u32,
    stats: Arc<WriteStats>,
}

impl BlockAllocationClient {
    /// Create an allocation client for one key
    ///
    /// `storage` is told to release blocks the allocator hands out on
    /// excluded targets.
    #[must_use]
    pub fn new(
        allocator: Arc<dyn BlockAllocator>,
        storage: Arc<dyn ReplicationClient>,
        key: KeyName,
        replication: ReplicationFactor,
        max_attempts: u32,
        stats: Arc<WriteStats>,
    ) -> Self {
        Self {
            allocator,
            storage,
            key,
            replication,
            max_attempts: max_attempts.max(1),
            stats,
        }
    }

    /// Allocate one block avoiding everything currently in `exclude`
    pub async fn allocate(&self, size_hint: u64, exclude: &ExcludeList) -> Result<AllocatedBlock> {
        let snapshot = exclude.snapshot();

        for attempt in 1..=self.max_attempts {
            let request = AllocationRequest {
                key: self.key.clone(),
                size_hint,
                replication: self.replication,
                exclude: snapshot.clone(),
            };

            let block = self
                .allocator
                .allocate_block(request)
                .await
                .map_err(|e| self.map_error(e))?;

            if snapshot.excludes_block(&block) {
                warn!(
                    key = %self.key,
                    block = %block.block_id,
                    pipeline = %block.pipeline.id,
                    attempt,
                    "allocator returned an excluded target, retrying"
                );
                self.storage.release(block.block_id).await;
                continue;
            }

            self.stats.record_allocation();
            info!(
                key = %self.key,
                block = %block.block_id,
                container = %block.container_id(),
                pipeline = %block.pipeline.id,
                capacity = block.capacity,
                "allocated block"
            );
            return Ok(block);
        }

        Err(Error::AllocationExhausted {
            key: self.key.to_string(),
            reason: format!(
                "allocator returned excluded targets {} times",
                self.max_attempts
            ),
        })
    }

    /// Allocate `count` blocks up front
    pub async fn allocate_many(
        &self,
        count: usize,
        size_hint: u64,
        exclude: &ExcludeList,
    ) -> Result<Vec<AllocatedBlock>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(self.allocate(size_hint, exclude).await?);
        }
        Ok(blocks)
    }

    fn map_error(&self, error: AllocationError) -> Error {
        match error {
            AllocationError::Exhausted(reason) => Error::AllocationExhausted {
                key: self.key.to_string(),
                reason,
            },
            AllocationError::Unavailable(reason) => Error::ServiceUnavailable(reason),
        }
    }
}
