//! pipewrite Placement - pipeline selection for block allocation
//!
//! The control plane keeps a `ClusterTopology` of storage nodes and the
//! replication pipelines built over them. When a writer asks for a block,
//! `PipelineSelector` ranks the open pipelines with rendezvous (HRW)
//! hashing keyed by the key name, skipping everything the writer's
//! exclusion snapshot rules out.
//!
//! # Example
//! ```ignore
//! use pipewrite_placement::{ClusterTopology, PipelineSelector};
//!
//! let selector = PipelineSelector::new(topology);
//! let pipeline = selector.select(b"volume/bucket/key", ReplicationFactor::Three, &exclude)?;
//! ```

pub mod selector;
pub mod topology;

pub use selector::{PipelineSelector, PlacementError};
pub use topology::{ClusterTopology, NodeInfo, NodeStatus, PipelineInfo, PipelineState};
