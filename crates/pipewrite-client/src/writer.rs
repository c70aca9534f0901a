//! Key writer
//!
//! `KeyWriter` turns a byte stream into a committed key. It keeps the
//! key's blocks as an ordered `Vec` of sessions: every entry but the last
//! is terminal, and the last one (if live) receives new bytes.
//!
//! Flushes run an explicit recovery loop. A transient failure is retried
//! against the same block a bounded number of times; anything else, or a
//! transient failure that keeps recurring, abandons the block, records an
//! exclusion and replays the block's unacknowledged tail onto a
//! replacement. Acknowledged bytes stay where they are, so each byte of the
//! key is committed exactly once.

use crate::allocation::{BlockAllocationClient, BlockAllocator};
use crate::classify::{Exclusion, RecoveryAction, classify};
use crate::exclude_list::ExcludeList;
use crate::metadata::{KeyCommit, KeyMetadataService};
use crate::replication::ReplicationClient;
use crate::session::{BlockWriteSession, SessionOptions, SessionState};
use crate::stats::{WriteStats, WriteStatsSnapshot};
use bytes::{Buf, Bytes, BytesMut};
use pipewrite_common::{
    AllocatedBlock, BlockDescriptor, ClientConfig, Error, KeyName, Result,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Collaborators a key writer talks to
#[derive(Clone)]
pub struct WriteClients {
    /// Control-plane allocation service
    pub allocator: Arc<dyn BlockAllocator>,
    /// Storage node replication client
    pub replication: Arc<dyn ReplicationClient>,
    /// Key metadata service
    pub metadata: Arc<dyn KeyMetadataService>,
}

enum WriterState {
    Open,
    Closed(KeyCommit),
    Aborted(String),
}

/// Writes one key
///
/// Methods take `&mut self`: a key has exactly one producer. Dropping the
/// writer without calling `close` commits nothing, and it does not release
/// the key's blocks either: call `abort` to give them back.
pub struct KeyWriter {
    key: KeyName,
    config: ClientConfig,
    clients: WriteClients,
    allocation: BlockAllocationClient,
    exclude_list: Arc<ExcludeList>,
    stats: Arc<WriteStats>,
    sessions: Vec<BlockWriteSession>,
    preallocated: VecDeque<AllocatedBlock>,
    accepted: u64,
    state: WriterState,
}

impl KeyWriter {
    /// Open a key for writing
    ///
    /// `expected_size` sizes the preallocation: up to
    /// `max_preallocated_blocks` blocks (at least one) are requested now.
    pub async fn open(
        key: KeyName,
        expected_size: u64,
        config: ClientConfig,
        clients: WriteClients,
    ) -> Result<Self> {
        config.validate()?;

        let exclude_list = Arc::new(match config.exclude_list_expiry() {
            Some(expiry) => ExcludeList::with_expiry(expiry),
            None => ExcludeList::new(),
        });
        let stats = Arc::new(WriteStats::new());
        let allocation = BlockAllocationClient::new(
            Arc::clone(&clients.allocator),
            Arc::clone(&clients.replication),
            key.clone(),
            config.replication,
            config.max_allocation_attempts,
            Arc::clone(&stats),
        );

        let wanted = expected_size
            .div_ceil(config.block_size)
            .min(u64::from(config.max_preallocated_blocks))
            .max(1);
        let blocks = allocation
            .allocate_many(
                usize::try_from(wanted).unwrap_or(1),
                config.block_size,
                &exclude_list,
            )
            .await?;

        info!(
            key = %key,
            expected_size,
            preallocated = blocks.len(),
            "opened key for write"
        );

        Ok(Self {
            key,
            config,
            clients,
            allocation,
            exclude_list,
            stats,
            sessions: Vec::new(),
            preallocated: blocks.into(),
            accepted: 0,
            state: WriterState::Open,
        })
    }

    /// Key being written
    #[must_use]
    pub const fn key(&self) -> &KeyName {
        &self.key
    }

    /// The key's exclusions
    #[must_use]
    pub const fn exclude_list(&self) -> &Arc<ExcludeList> {
        &self.exclude_list
    }

    /// Blocks that hold (or will hold) committed bytes, in key order
    #[must_use]
    pub fn block_descriptors(&self) -> Vec<BlockDescriptor> {
        self.sessions
            .iter()
            .filter(|s| !(s.state() == SessionState::Failed && s.acked_len() == 0))
            .map(BlockWriteSession::descriptor)
            .collect()
    }

    /// Number of blocks held: written, failed, active and preallocated
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.sessions.len() + self.preallocated.len()
    }

    /// Bytes accepted from the caller
    #[must_use]
    pub const fn accepted_length(&self) -> u64 {
        self.accepted
    }

    /// Bytes acknowledged by the pipelines; zero once aborted
    #[must_use]
    pub fn committed_length(&self) -> u64 {
        if matches!(self.state, WriterState::Aborted(_)) {
            return 0;
        }
        self.sessions.iter().map(BlockWriteSession::acked_len).sum()
    }

    /// Write counters
    #[must_use]
    pub fn stats(&self) -> WriteStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, WriterState::Closed(_))
    }

    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.state, WriterState::Aborted(_))
    }

    /// Append `data` to the key
    ///
    /// Returns once the bytes are buffered. A block that fills up is closed
    /// before the next one is opened, and the active block is flushed once
    /// it holds `buffer_flush_size` unacknowledged bytes.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let result = self.write_inner(data).await;
        self.poison_on_error(result).await
    }

    /// Make every accepted byte durable; returns the committed length
    pub async fn flush(&mut self) -> Result<u64> {
        self.ensure_writable()?;
        let result = self.flush_with_recovery(false).await;
        self.poison_on_error(result).await?;
        Ok(self.committed_length())
    }

    /// Flush, close every block and commit the key
    ///
    /// Closing twice returns the first commit.
    pub async fn close(&mut self) -> Result<KeyCommit> {
        match &self.state {
            WriterState::Closed(commit) => return Ok(commit.clone()),
            WriterState::Aborted(reason) => return Err(Error::KeyAborted(reason.clone())),
            WriterState::Open => {}
        }
        let result = self.close_inner().await;
        self.poison_on_error(result).await
    }

    /// Give up on the key: release every block and commit nothing
    pub async fn abort(&mut self) -> Result<()> {
        match &self.state {
            WriterState::Closed(_) => return Err(Error::KeyClosed(self.key.to_string())),
            WriterState::Aborted(_) => return Ok(()),
            WriterState::Open => {}
        }
        warn!(key = %self.key, accepted = self.accepted, "aborting key write");
        self.abandon_all().await;
        self.state = WriterState::Aborted("aborted by caller".to_string());
        Ok(())
    }

    async fn write_inner(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let idx = self.ensure_active().await?;
            let taken = self.sessions[idx].write(data)?;
            self.accepted += taken as u64;
            self.stats.record_accepted(taken as u64);
            data = &data[taken..];

            let session = &self.sessions[idx];
            if session.is_full() || session.buffered_len() >= self.config.buffer_flush_size {
                self.flush_with_recovery(false).await?;
            }
        }
        Ok(())
    }

    async fn close_inner(&mut self) -> Result<KeyCommit> {
        self.flush_with_recovery(true).await?;

        let unused: Vec<AllocatedBlock> = self.preallocated.drain(..).collect();
        for block in &unused {
            debug!(key = %self.key, block = %block.block_id, "releasing unused block");
            self.clients.replication.release(block.block_id).await;
        }

        let blocks = self.block_descriptors();
        let total_length: u64 = blocks.iter().map(|b| b.length).sum();
        if total_length != self.accepted {
            return Err(Error::internal(format!(
                "committed {total_length} bytes but accepted {}",
                self.accepted
            )));
        }

        let commit = KeyCommit {
            key: self.key.clone(),
            blocks,
            total_length,
        };
        self.clients.metadata.commit_key(commit.clone()).await?;
        self.exclude_list.clear();

        info!(
            key = %self.key,
            blocks = commit.blocks.len(),
            length = total_length,
            replacements = self.stats.replacements(),
            "committed key"
        );
        self.state = WriterState::Closed(commit.clone());
        Ok(commit)
    }

    /// Flush the active block, recovering from replication failures
    ///
    /// With `finalize` every block touched is closed; otherwise only full
    /// blocks are.
    async fn flush_with_recovery(&mut self, finalize: bool) -> Result<()> {
        let mut in_place_attempts = 0u32;
        let mut replacements = 0u32;
        let mut pending = Bytes::new();

        loop {
            if !pending.is_empty() && self.active_index().is_none() {
                let idx = self.ensure_active().await?;
                let taken = self.sessions[idx].write(&pending)?;
                pending.advance(taken);
            }

            let Some(idx) = self.active_index() else {
                return Ok(());
            };
            let session = &mut self.sessions[idx];
            let closing = finalize || session.is_full() || !pending.is_empty();
            let result = if closing {
                session.close().await
            } else {
                session.flush().await
            };

            let failure = match result {
                Ok(_) if pending.is_empty() => return Ok(()),
                Ok(_) => {
                    // Full block closed; the rest goes to a fresh session
                    in_place_attempts = 0;
                    continue;
                }
                Err(failure) => failure,
            };

            match classify(
                &failure,
                session.block(),
                in_place_attempts,
                self.config.max_in_place_retries,
            ) {
                RecoveryAction::RetryInPlace => {
                    in_place_attempts += 1;
                    self.stats.record_in_place_retry();
                    debug!(
                        key = %self.key,
                        block = %session.block_id(),
                        attempt = in_place_attempts,
                        "retrying block in place"
                    );
                }
                RecoveryAction::Replace(exclusion) => {
                    session.abandon().await;
                    let tail = session.take_unacknowledged();
                    let failed_block = session.block_id();

                    if replacements >= self.config.max_retries {
                        error!(
                            key = %self.key,
                            block = %failed_block,
                            attempts = replacements,
                            lost = tail.len() + pending.len(),
                            "write retries exhausted"
                        );
                        return Err(Error::RetriesExhausted {
                            attempts: replacements,
                            last: failure,
                        });
                    }
                    replacements += 1;
                    in_place_attempts = 0;

                    self.record_exclusion(&exclusion).await;
                    self.stats.record_replacement(tail.len() as u64);
                    warn!(
                        key = %self.key,
                        block = %failed_block,
                        replay = tail.len(),
                        attempt = replacements,
                        "replaying unacknowledged bytes on a new block"
                    );

                    pending = if pending.is_empty() {
                        tail
                    } else {
                        let mut joined = BytesMut::with_capacity(tail.len() + pending.len());
                        joined.extend_from_slice(&tail);
                        joined.extend_from_slice(&pending);
                        joined.freeze()
                    };
                }
            }

            let interval = self.config.retry_interval();
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Record an exclusion and drop preallocated blocks it rules out
    async fn record_exclusion(&mut self, exclusion: &Exclusion) {
        let (containers, pipelines, nodes) = exclusion.apply(&self.exclude_list);
        self.stats.record_exclusions(containers, pipelines, nodes);
        info!(
            key = %self.key,
            kind = exclusion.kind(),
            exclusion = ?exclusion,
            "excluded failed target"
        );

        let snapshot = self.exclude_list.snapshot();
        let (stale, keep): (Vec<AllocatedBlock>, Vec<AllocatedBlock>) = self
            .preallocated
            .drain(..)
            .partition(|block| snapshot.excludes_block(block));
        self.preallocated = keep.into();
        for block in &stale {
            debug!(key = %self.key, block = %block.block_id, "discarding preallocated block");
            self.clients.replication.release(block.block_id).await;
        }
    }

    fn active_index(&self) -> Option<usize> {
        let idx = self.sessions.len().checked_sub(1)?;
        (!self.sessions[idx].is_terminal()).then_some(idx)
    }

    /// Index of a live, non-full session, opening one if needed
    async fn ensure_active(&mut self) -> Result<usize> {
        if let Some(idx) = self.active_index() {
            if self.sessions[idx].is_full() {
                return Err(Error::internal(format!(
                    "block {} is full but still open",
                    self.sessions[idx].block_id()
                )));
            }
            return Ok(idx);
        }

        let block = match self.preallocated.pop_front() {
            Some(block) => block,
            None => {
                self.allocation
                    .allocate(self.config.block_size, &self.exclude_list)
                    .await?
            }
        };
        if block.capacity == 0 {
            return Err(Error::internal(format!(
                "block {} has no capacity",
                block.block_id
            )));
        }

        let key_offset = self.sessions.iter().map(BlockWriteSession::acked_len).sum();
        debug!(key = %self.key, block = %block.block_id, key_offset, "opening block session");
        self.sessions.push(BlockWriteSession::new(
            block,
            key_offset,
            Arc::clone(&self.clients.replication),
            self.session_options(),
            Arc::clone(&self.stats),
        ));
        Ok(self.sessions.len() - 1)
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            chunk_size: self.config.chunk_size,
            checksum: self.config.checksum.clone(),
            watch_timeout: self.config.watch_timeout(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match &self.state {
            WriterState::Open => Ok(()),
            WriterState::Closed(_) => Err(Error::KeyClosed(self.key.to_string())),
            WriterState::Aborted(reason) => Err(Error::KeyAborted(reason.clone())),
        }
    }

    async fn abandon_all(&mut self) {
        for session in &mut self.sessions {
            if !session.is_terminal() {
                session.abandon().await;
            }
        }
        let unused: Vec<AllocatedBlock> = self.preallocated.drain(..).collect();
        for block in &unused {
            self.clients.replication.release(block.block_id).await;
        }
        self.exclude_list.clear();
    }

    /// Any error escaping the write path leaves the stream in an unknown
    /// state, so the writer is poisoned.
    async fn poison_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(key = %self.key, error = %e, "key write failed");
            self.abandon_all().await;
            self.state = WriterState::Aborted(e.to_string());
        }
        result
    }
}

impl Drop for KeyWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Open) {
            warn!(
                key = %self.key,
                accepted = self.accepted,
                blocks = self.block_count(),
                "key writer dropped while open; nothing committed or released"
            );
        }
    }
}

impl std::fmt::Debug for KeyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWriter")
            .field("key", &self.key)
            .field("sessions", &self.sessions)
            .field("preallocated", &self.preallocated.len())
            .field("accepted", &self.accepted)
            .finish_non_exhaustive()
    }
}
