//! Scripted collaborators for unit tests

use crate::allocation::{AllocationRequest, BlockAllocator};
use crate::metadata::{KeyCommit, KeyMetadataService};
use crate::replication::{ChunkWrite, CommitAck, ReplicationClient};
use crate::writer::WriteClients;
use async_trait::async_trait;
use parking_lot::Mutex;
use pipewrite_common::{
    AllocatedBlock, AllocationError, BlockId, CommitError, ContainerId, NodeId, Pipeline,
    PipelineId, ReplicationFactor, ReplicationFailure,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Scripted result of one `watch_for_commit` call
enum WatchOutcome {
    Fail(ReplicationFailure),
    /// Commit everything asked for
    Ack,
    /// Commit at most this block offset
    AckUpTo(u64),
}

#[derive(Default)]
struct ReplicationState {
    blocks: HashMap<BlockId, Vec<u8>>,
    write_faults: VecDeque<ReplicationFailure>,
    watches: VecDeque<WatchOutcome>,
    hang_watches: bool,
    chunks: Vec<(BlockId, u64, usize)>,
    released: Vec<BlockId>,
}

/// Replication double that fails on cue
#[derive(Default)]
pub struct ScriptedReplication {
    state: Mutex<ReplicationState>,
}

impl ScriptedReplication {
    pub fn fail_next_write(&self, failure: ReplicationFailure) {
        self.state.lock().write_faults.push_back(failure);
    }

    /// Queue a failing watch; unscripted watches ack in full
    pub fn fail_next_watch(&self, failure: ReplicationFailure) {
        self.state.lock().watches.push_back(WatchOutcome::Fail(failure));
    }

    /// Queue a watch that acks in full
    pub fn ack_next_watch(&self) {
        self.state.lock().watches.push_back(WatchOutcome::Ack);
    }

    /// Queue a watch that commits no further than `offset`
    pub fn ack_next_watch_up_to(&self, offset: u64) {
        self.state.lock().watches.push_back(WatchOutcome::AckUpTo(offset));
    }

    pub fn hang_watches(&self) {
        self.state.lock().hang_watches = true;
    }

    pub fn data(&self, block: BlockId) -> Vec<u8> {
        self.state.lock().blocks.get(&block).cloned().unwrap_or_default()
    }

    /// `(block, offset, len)` of every accepted chunk
    pub fn chunks(&self) -> Vec<(BlockId, u64, usize)> {
        self.state.lock().chunks.clone()
    }

    pub fn released(&self) -> Vec<BlockId> {
        self.state.lock().released.clone()
    }
}

#[async_trait]
impl ReplicationClient for ScriptedReplication {
    async fn write_chunk(&self, chunk: ChunkWrite) -> Result<(), ReplicationFailure> {
        let mut state = self.state.lock();
        if let Some(failure) = state.write_faults.pop_front() {
            return Err(failure);
        }
        assert!(chunk.checksum.verify(&chunk.data), "chunk checksum mismatch");
        state
            .chunks
            .push((chunk.block_id, chunk.offset, chunk.data.len()));
        let data = state.blocks.entry(chunk.block_id).or_default();
        data.truncate(chunk.offset as usize);
        assert_eq!(data.len() as u64, chunk.offset, "chunk leaves a gap");
        data.extend_from_slice(&chunk.data);
        Ok(())
    }

    async fn watch_for_commit(
        &self,
        block_id: BlockId,
        _pipeline: &Pipeline,
        offset: u64,
    ) -> Result<CommitAck, ReplicationFailure> {
        let (hang, ack_offset) = {
            let mut state = self.state.lock();
            let ack_offset = match state.watches.pop_front() {
                Some(WatchOutcome::Fail(failure)) => return Err(failure),
                Some(WatchOutcome::AckUpTo(limit)) => offset.min(limit),
                Some(WatchOutcome::Ack) | None => offset,
            };
            let written = state.blocks.get(&block_id).map_or(0, Vec::len) as u64;
            assert!(written >= offset, "watch past written data");
            (state.hang_watches, ack_offset)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(CommitAck { ack_offset })
    }

    async fn release(&self, block_id: BlockId) {
        self.state.lock().released.push(block_id);
    }
}

/// Allocator double over a fixed set of pipelines
pub struct ScriptedAllocator {
    pipelines: Vec<Pipeline>,
    capacity: u64,
    next_container: Mutex<u64>,
    forced: Mutex<VecDeque<Result<AllocatedBlock, AllocationError>>>,
    requests: Mutex<Vec<AllocationRequest>>,
}

impl ScriptedAllocator {
    pub fn new(pipeline_count: usize, capacity: u64) -> Self {
        let pipelines = (0..pipeline_count)
            .map(|_| {
                Pipeline::new(
                    PipelineId::new(),
                    vec![NodeId::new(), NodeId::new(), NodeId::new()],
                    ReplicationFactor::Three,
                )
            })
            .collect();
        Self {
            pipelines,
            capacity,
            next_container: Mutex::new(1),
            forced: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// Return `reply` for the next request regardless of exclusions
    pub fn force_next(&self, reply: Result<AllocatedBlock, AllocationError>) {
        self.forced.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<AllocationRequest> {
        self.requests.lock().clone()
    }

    pub fn block_on(&self, pipeline: &Pipeline) -> AllocatedBlock {
        let mut next = self.next_container.lock();
        let block = AllocatedBlock {
            block_id: BlockId::new(ContainerId::new(*next), 1),
            pipeline: pipeline.clone(),
            capacity: self.capacity,
        };
        *next += 1;
        block
    }
}

#[async_trait]
impl BlockAllocator for ScriptedAllocator {
    async fn allocate_block(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocatedBlock, AllocationError> {
        self.requests.lock().push(request.clone());
        if let Some(reply) = self.forced.lock().pop_front() {
            return reply;
        }
        let pipeline = self
            .pipelines
            .iter()
            .find(|p| !request.exclude.excludes_pipeline(p))
            .ok_or_else(|| AllocationError::Exhausted("all pipelines excluded".into()))?;
        Ok(self.block_on(pipeline))
    }
}

/// Metadata double that records commits
#[derive(Default)]
pub struct RecordingMetadata {
    commits: Mutex<Vec<KeyCommit>>,
    fail_next: Mutex<Option<CommitError>>,
}

impl RecordingMetadata {
    pub fn commits(&self) -> Vec<KeyCommit> {
        self.commits.lock().clone()
    }

    pub fn fail_next(&self, error: CommitError) {
        *self.fail_next.lock() = Some(error);
    }
}

#[async_trait]
impl KeyMetadataService for RecordingMetadata {
    async fn commit_key(&self, commit: KeyCommit) -> Result<(), CommitError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        self.commits.lock().push(commit);
        Ok(())
    }
}

/// All three doubles, wired together
pub struct Harness {
    pub allocator: Arc<ScriptedAllocator>,
    pub replication: Arc<ScriptedReplication>,
    pub metadata: Arc<RecordingMetadata>,
}

impl Harness {
    pub fn new(pipeline_count: usize, capacity: u64) -> Self {
        Self {
            allocator: Arc::new(ScriptedAllocator::new(pipeline_count, capacity)),
            replication: Arc::new(ScriptedReplication::default()),
            metadata: Arc::new(RecordingMetadata::default()),
        }
    }

    pub fn clients(&self) -> WriteClients {
        WriteClients {
            allocator: self.allocator.clone(),
            replication: self.replication.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
