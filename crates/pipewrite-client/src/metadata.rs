//! Metadata service interface

use async_trait::async_trait;
use pipewrite_common::{BlockDescriptor, CommitError, KeyName};
use serde::Serialize;

/// Final layout of a key, recorded once the write completes
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyCommit {
    /// Key name
    pub key: KeyName,
    /// Blocks in key order; offsets are contiguous from zero
    pub blocks: Vec<BlockDescriptor>,
    /// Sum of block lengths
    pub total_length: u64,
}

impl KeyCommit {
    /// Whether the block offsets tile `[0, total_length)` without gaps
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 0;
        for block in &self.blocks {
            if block.offset != expected {
                return false;
            }
            expected += block.length;
        }
        expected == self.total_length
    }
}

/// Service that persists key to block mappings
#[async_trait]
pub trait KeyMetadataService: Send + Sync {
    /// Record a completed key; failure is fatal to the write
    async fn commit_key(&self, commit: KeyCommit) -> Result<(), CommitError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewrite_common::{BlockId, ContainerId, PipelineId};

    fn descriptor(container: u64, offset: u64, length: u64) -> BlockDescriptor {
        BlockDescriptor {
            block_id: BlockId::new(ContainerId::new(container), 1),
            pipeline_id: PipelineId::new(),
            offset,
            length,
        }
    }

    #[test]
    fn test_contiguous_layout() {
        let key = KeyName::new("k").unwrap();
        let commit = KeyCommit {
            key: key.clone(),
            blocks: vec![descriptor(1, 0, 10), descriptor(2, 10, 5)],
            total_length: 15,
        };
        assert!(commit.is_contiguous());

        let gap = KeyCommit {
            key,
            blocks: vec![descriptor(1, 0, 10), descriptor(2, 12, 5)],
            total_length: 17,
        };
        assert!(!gap.is_contiguous());
    }
}
