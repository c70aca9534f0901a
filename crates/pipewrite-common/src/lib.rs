//! pipewrite Common - Shared types and utilities
//!
//! This crate provides the identifiers, descriptors, error taxonomy,
//! checksums and configuration shared by the key write path and the
//! services it talks to.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{ChecksumCalculator, ChecksumType, ChunkChecksum, PayloadDigest};
pub use config::{ChecksumConfig, ClientConfig, Config, LoggingConfig};
pub use error::{AllocationError, CommitError, Error, ReplicationFailure, Result};
pub use types::*;
