//! pipewrite Client - key write path
//!
//! A key is written as an ordered sequence of blocks. Each block is
//! replicated by a pipeline of storage nodes; when a node, pipeline or
//! container fails part-way through, the writer records the culprit in the
//! key's `ExcludeList`, asks for a replacement block that avoids it, and
//! replays whatever the failed block never acknowledged.
//!
//! The collaborators are traits: `BlockAllocator` (control plane),
//! `ReplicationClient` (storage nodes) and `KeyMetadataService`.
//!
//! # Example
//! ```ignore
//! let mut writer = KeyWriter::open(key, payload.len() as u64, config, clients).await?;
//! writer.write(&payload).await?;
//! let commit = writer.close().await?;
//! ```

pub mod allocation;
pub mod classify;
pub mod exclude_list;
pub mod metadata;
pub mod replication;
pub mod session;
pub mod stats;
pub mod writer;

#[cfg(test)]
mod testing;

pub use allocation::{AllocationRequest, BlockAllocationClient, BlockAllocator};
pub use classify::{Exclusion, RecoveryAction, classify};
pub use exclude_list::ExcludeList;
pub use metadata::{KeyCommit, KeyMetadataService};
pub use replication::{ChunkWrite, CommitAck, ReplicationClient};
pub use session::{BlockWriteSession, SessionOptions, SessionState};
pub use stats::{WriteStats, WriteStatsSnapshot};
pub use writer::{KeyWriter, WriteClients};
