//! Checksum utilities for pipewrite
//!
//! Every chunk sent to a pipeline carries a `ChunkChecksum`: one digest per
//! `bytes_per_checksum` window, so a storage node can verify the chunk
//! without buffering the whole block.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Algorithm used for chunk checksums
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// No verification
    None,
    /// CRC32C per window (fast, inline)
    #[default]
    Crc32c,
    /// SHA256 per window
    Sha256,
}

/// Checksums covering one chunk, window by window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChecksum {
    /// Algorithm used
    pub checksum_type: ChecksumType,
    /// Window size in bytes
    pub bytes_per_checksum: u32,
    /// One digest per window, in order
    pub values: Vec<Vec<u8>>,
}

impl ChunkChecksum {
    /// Compute checksums for `data`
    #[must_use]
    pub fn compute(checksum_type: ChecksumType, bytes_per_checksum: u32, data: &[u8]) -> Self {
        let window = bytes_per_checksum.max(1) as usize;
        let values = match checksum_type {
            ChecksumType::None => Vec::new(),
            ChecksumType::Crc32c => data
                .chunks(window)
                .map(|w| crc32c::crc32c(w).to_le_bytes().to_vec())
                .collect(),
            ChecksumType::Sha256 => data
                .chunks(window)
                .map(|w| Sha256::digest(w).to_vec())
                .collect(),
        };

        Self {
            checksum_type,
            bytes_per_checksum: window as u32,
            values,
        }
    }

    /// Verify `data` against these checksums
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        if self.checksum_type == ChecksumType::None {
            return true;
        }
        Self::compute(self.checksum_type, self.bytes_per_checksum, data) == *self
    }
}

/// Streaming whole-payload digest, used to compare written and read-back data
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    sha256: Option<Sha256>,
    len: u64,
}

/// Finalized digest of a payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDigest {
    /// Payload length
    pub len: u64,
    /// CRC32C of the payload
    pub crc32c: u32,
    /// xxHash64 of the payload
    pub xxhash64: u64,
    /// SHA256, when requested
    pub sha256: Option<[u8; 32]>,
}

impl ChecksumCalculator {
    /// Create a new calculator (without SHA256)
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            sha256: None,
            len: 0,
        }
    }

    /// Create a new calculator with SHA256
    #[must_use]
    pub fn with_sha256() -> Self {
        Self {
            sha256: Some(Sha256::new()),
            ..Self::new()
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        if let Some(ref mut sha256) = self.sha256 {
            sha256.update(data);
        }
        self.len += data.len() as u64;
    }

    /// Finalize and return the computed digest
    #[must_use]
    pub fn finalize(self) -> PayloadDigest {
        PayloadDigest {
            len: self.len,
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
            sha256: self.sha256.map(|h| h.finalize().into()),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}
