//! Per-block write session
//!
//! A `BlockWriteSession` owns one allocated block. Caller bytes are
//! buffered until `flush`, which sends every unsent byte to the pipeline in
//! checksummed chunks and then waits for the pipeline to commit them.
//! Acknowledged bytes leave the buffer; only the unacknowledged tail is
//! kept, so a failed block can hand it back for replay elsewhere.
//!
//! ```text
//!            write            flush ok (not final)
//!   Open ───────────► Open ◄──────────────────┐
//!     │                                       │
//!     └── flush/close ──► Flushing ───────────┤
//!                           │  transient      │
//!                           ├─────────────────┘
//!                           ├── close ok ──► Closed
//!                           └── failure ───► Failed
//! ```

use crate::replication::{ChunkWrite, ReplicationClient};
use crate::stats::WriteStats;
use bytes::{Buf, Bytes, BytesMut};
use pipewrite_common::{
    AllocatedBlock, BlockDescriptor, BlockId, ChecksumConfig, ChunkChecksum, Error,
    ReplicationFailure, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle state of a block session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting bytes
    Open,
    /// Chunks issued, waiting for commit
    Flushing,
    /// Fully committed; terminal
    Closed,
    /// Unrecoverable failure or abandoned; terminal
    Failed,
}

/// Parameters shared by every session of a key
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Maximum bytes per chunk write
    pub chunk_size: u64,
    /// Chunk checksum settings
    pub checksum: ChecksumConfig,
    /// How long a commit watch may take
    pub watch_timeout: Duration,
}

/// Write session for one block
pub struct BlockWriteSession {
    block: AllocatedBlock,
    key_offset: u64,
    client: Arc<dyn ReplicationClient>,
    options: SessionOptions,
    stats: Arc<WriteStats>,
    state: SessionState,
    /// Bytes in `[acked, acked + buffer.len())`
    buffer: BytesMut,
    acked: u64,
    sent: u64,
    last_failure: Option<ReplicationFailure>,
}

impl BlockWriteSession {
    /// Start a session on `block`, whose first byte is `key_offset` in the key
    #[must_use]
    pub fn new(
        block: AllocatedBlock,
        key_offset: u64,
        client: Arc<dyn ReplicationClient>,
        options: SessionOptions,
        stats: Arc<WriteStats>,
    ) -> Self {
        Self {
            block,
            key_offset,
            client,
            options,
            stats,
            state: SessionState::Open,
            buffer: BytesMut::new(),
            acked: 0,
            sent: 0,
            last_failure: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn block(&self) -> &AllocatedBlock {
        &self.block
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block.block_id
    }

    /// Highest block offset the pipeline has committed
    #[must_use]
    pub const fn acked_len(&self) -> u64 {
        self.acked
    }

    /// Bytes accepted into this block so far
    #[must_use]
    pub fn written_len(&self) -> u64 {
        self.acked + self.buffer.len() as u64
    }

    /// Bytes buffered but not yet acknowledged
    #[must_use]
    pub fn buffered_len(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Room left in the block
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.block.capacity.saturating_sub(self.written_len())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Failed)
    }

    /// Descriptor covering the acknowledged bytes
    #[must_use]
    pub const fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor {
            block_id: self.block.block_id,
            pipeline_id: self.block.pipeline.id,
            offset: self.key_offset,
            length: self.acked,
        }
    }

    /// Buffer as much of `data` as fits; returns the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.state != SessionState::Open {
            return Err(Error::invalid_state(format!(
                "block {} is {:?}, cannot accept writes",
                self.block.block_id, self.state
            )));
        }
        let take = data
            .len()
            .min(usize::try_from(self.remaining()).unwrap_or(usize::MAX));
        self.buffer.extend_from_slice(&data[..take]);
        Ok(take)
    }

    /// Send unsent bytes and wait for them to commit
    ///
    /// Returns the committed length of the block. A transient failure
    /// leaves the session `Open` with the send position rewound to the
    /// committed offset; any other failure moves it to `Failed`.
    pub async fn flush(&mut self) -> std::result::Result<u64, ReplicationFailure> {
        match self.state {
            SessionState::Closed => return Ok(self.acked),
            SessionState::Failed => {
                return Err(self
                    .last_failure
                    .clone()
                    .unwrap_or_else(|| ReplicationFailure::transient("session abandoned")));
            }
            SessionState::Open | SessionState::Flushing => {}
        }
        if self.buffer.is_empty() {
            return Ok(self.acked);
        }

        self.state = SessionState::Flushing;
        self.stats.record_flush();
        match self.send_and_watch().await {
            Ok(acked) => {
                self.state = SessionState::Open;
                Ok(acked)
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    /// Final flush; on success the session is `Closed`
    pub async fn close(&mut self) -> std::result::Result<u64, ReplicationFailure> {
        let acked = self.flush().await?;
        self.state = SessionState::Closed;
        debug!(block = %self.block.block_id, length = acked, "block closed");
        Ok(acked)
    }

    /// Force the session to `Failed` and release replication resources
    ///
    /// A closed session is left as it is.
    pub async fn abandon(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Failed;
        self.client.release(self.block.block_id).await;
    }

    /// Hand back the unacknowledged bytes of a failed session
    ///
    /// Afterwards the session holds exactly its committed bytes.
    pub fn take_unacknowledged(&mut self) -> Bytes {
        self.sent = self.acked;
        self.buffer.split().freeze()
    }

    async fn send_and_watch(&mut self) -> std::result::Result<u64, ReplicationFailure> {
        let written = self.written_len();
        let chunk_size = usize::try_from(self.options.chunk_size).unwrap_or(usize::MAX).max(1);

        while self.sent < written {
            let start = usize::try_from(self.sent - self.acked).unwrap_or(usize::MAX);
            let end = (start + chunk_size).min(self.buffer.len());
            let data = Bytes::copy_from_slice(&self.buffer[start..end]);
            let checksum = ChunkChecksum::compute(
                self.options.checksum.checksum_type,
                self.options.checksum.bytes_per_checksum,
                &data,
            );
            let chunk = ChunkWrite {
                block_id: self.block.block_id,
                pipeline: self.block.pipeline.clone(),
                offset: self.sent,
                data,
                checksum,
            };
            let end_offset = chunk.end_offset();

            debug!(
                block = %self.block.block_id,
                offset = chunk.offset,
                len = chunk.data.len(),
                "write chunk"
            );
            self.client.write_chunk(chunk).await?;
            self.stats.record_chunk();
            self.sent = end_offset;
        }

        let watch = self
            .client
            .watch_for_commit(self.block.block_id, &self.block.pipeline, written);
        let ack = match tokio::time::timeout(self.options.watch_timeout, watch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ReplicationFailure::PipelineFailed {
                    pipeline: self.block.pipeline.id,
                    unreachable: Vec::new(),
                });
            }
        };

        let committed = ack.ack_offset.min(written);
        if committed > self.acked {
            let advance = usize::try_from(committed - self.acked).unwrap_or(usize::MAX);
            self.buffer.advance(advance);
            self.acked = committed;
        }
        if committed < written {
            return Err(ReplicationFailure::transient(format!(
                "partial commit: {committed} of {written} bytes"
            )));
        }
        Ok(self.acked)
    }

    fn fail(&mut self, failure: ReplicationFailure) -> ReplicationFailure {
        warn!(
            block = %self.block.block_id,
            pipeline = %self.block.pipeline.id,
            acked = self.acked,
            unacked = self.buffer.len(),
            kind = failure.kind(),
            error = %failure,
            "block flush failed"
        );
        if failure.is_terminal() {
            self.state = SessionState::Failed;
            self.last_failure = Some(failure.clone());
        } else {
            self.state = SessionState::Open;
            self.sent = self.acked;
        }
        failure
    }
}

impl std::fmt::Debug for BlockWriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriteSession")
            .field("block", &self.block.block_id)
            .field("pipeline", &self.block.pipeline.id)
            .field("key_offset", &self.key_offset)
            .field("state", &self.state)
            .field("acked", &self.acked)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
