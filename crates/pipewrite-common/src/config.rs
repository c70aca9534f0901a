//! Configuration types for pipewrite
//!
//! `Config` is the on-disk (TOML) shape; `ClientConfig` is what a key
//! writer consumes. Every field has a default so partial files load.

use crate::checksum::ChecksumType;
use crate::error::{Error, Result};
use crate::types::ReplicationFactor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Root configuration for pipewrite
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key write path configuration
    pub client: ClientConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.client.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level/filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Chunk checksum configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    /// Algorithm
    pub checksum_type: ChecksumType,
    /// Window size covered by each checksum value
    pub bytes_per_checksum: u32,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            checksum_type: ChecksumType::Crc32c,
            bytes_per_checksum: MB as u32,
        }
    }
}

/// Key writer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity requested for each block (default: 256 MB)
    pub block_size: u64,
    /// Maximum bytes per chunk write (default: 4 MB)
    pub chunk_size: u64,
    /// Unflushed bytes that trigger a flush from `write` (default: 16 MB)
    pub buffer_flush_size: u64,
    /// Replication factor requested from the control plane
    pub replication: ReplicationFactor,
    /// Replacement blocks allowed per flush/close call
    pub max_retries: u32,
    /// In-place retries for transient failures before escalating
    pub max_in_place_retries: u32,
    /// Pause between retries (milliseconds)
    pub retry_interval_ms: u64,
    /// Commit watch timeout (milliseconds)
    pub watch_timeout_ms: u64,
    /// Allocation attempts when the allocator returns an excluded target
    pub max_allocation_attempts: u32,
    /// Upper bound on blocks preallocated when a key is opened
    pub max_preallocated_blocks: u32,
    /// Age after which exclusions are forgotten; unset keeps them for the whole key
    pub exclude_list_expiry_ms: Option<u64>,
    /// Chunk checksums
    pub checksum: ChecksumConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            block_size: 256 * MB,
            chunk_size: 4 * MB,
            buffer_flush_size: 16 * MB,
            replication: ReplicationFactor::Three,
            max_retries: 5,
            max_in_place_retries: 3,
            retry_interval_ms: 0,
            watch_timeout_ms: 30_000,
            max_allocation_attempts: 3,
            max_preallocated_blocks: 1,
            exclude_list_expiry_ms: None,
            checksum: ChecksumConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reject settings the writer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::configuration("block_size must be non-zero"));
        }
        if self.chunk_size == 0 {
            return Err(Error::configuration("chunk_size must be non-zero"));
        }
        if self.chunk_size > self.block_size {
            return Err(Error::configuration(format!(
                "chunk_size {} exceeds block_size {}",
                self.chunk_size, self.block_size
            )));
        }
        if self.buffer_flush_size == 0 {
            return Err(Error::configuration("buffer_flush_size must be non-zero"));
        }
        if self.max_allocation_attempts == 0 {
            return Err(Error::configuration("max_allocation_attempts must be non-zero"));
        }
        Ok(())
    }

    /// Pause between retries
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Commit watch timeout
    #[must_use]
    pub const fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    /// Exclusion expiry window, if any
    #[must_use]
    pub fn exclude_list_expiry(&self) -> Option<Duration> {
        self.exclude_list_expiry_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.block_size, 256 * MB);
        assert_eq!(config.client.chunk_size, 4 * MB);
        assert_eq!(config.client.max_retries, 5);
        assert!(config.client.exclude_list_expiry().is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.client.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [client]
            block_size = 4194304
            chunk_size = 1048576
            max_retries = 2

            [client.checksum]
            checksum_type = "sha256"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.block_size, 4 * MB);
        assert_eq!(config.client.max_retries, 2);
        assert_eq!(config.client.max_in_place_retries, 3);
        assert_eq!(config.client.checksum.checksum_type, ChecksumType::Sha256);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let err = Config::from_toml_str("[client]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Config::from_toml_str("[client]\nblock_size = 1024\nchunk_size = 2048\n")
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nwatch_timeout_ms = 500").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.client.watch_timeout(), Duration::from_millis(500));
    }
}
