//! Replication layer interface

use async_trait::async_trait;
use bytes::Bytes;
use pipewrite_common::{BlockId, ChunkChecksum, Pipeline, ReplicationFailure};

/// One chunk of a block, sent to every member of the block's pipeline
#[derive(Clone, Debug)]
pub struct ChunkWrite {
    /// Target block
    pub block_id: BlockId,
    /// Pipeline replicating the block
    pub pipeline: Pipeline,
    /// Offset of the chunk within the block
    pub offset: u64,
    /// Chunk payload
    pub data: Bytes,
    /// Checksums over `data`
    pub checksum: ChunkChecksum,
}

impl ChunkWrite {
    /// Block offset just past this chunk
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Acknowledgement returned by a commit watch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitAck {
    /// Highest block offset durably committed by the pipeline
    pub ack_offset: u64,
}

/// Client for the storage nodes that replicate blocks
///
/// Chunk writes may be accepted before they are durable; durability is
/// established by `watch_for_commit`. Rewriting an offset that was sent
/// but never acknowledged replaces the earlier bytes.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Send a chunk to the block's pipeline
    async fn write_chunk(&self, chunk: ChunkWrite) -> Result<(), ReplicationFailure>;

    /// Wait until the pipeline has committed the block up to `offset`
    async fn watch_for_commit(
        &self,
        block_id: BlockId,
        pipeline: &Pipeline,
        offset: u64,
    ) -> Result<CommitAck, ReplicationFailure>;

    /// Drop any client-side state held for the block
    async fn release(&self, block_id: BlockId);
}
