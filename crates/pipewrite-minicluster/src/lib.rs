//! pipewrite MiniCluster - in-memory control plane, storage nodes and
//! metadata service
//!
//! `MiniCluster` implements every collaborator of the key writer
//! (`BlockAllocator`, `ReplicationClient`, `KeyMetadataService`) in one
//! process, and lets tests break it: shut nodes down, close containers,
//! inject transient faults or reject the key commit.
//!
//! The control plane is unaware of node shutdowns, so the
//! only thing steering allocation away from a failed node is the writer's
//! own exclude list.

pub mod cluster;
mod control;
mod datanode;

pub use cluster::{ClusterError, CommitWatch, MiniCluster, MiniClusterBuilder};
