//! Cluster topology representation

use pipewrite_common::{NodeId, Pipeline, PipelineId, ReplicationFactor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node status as known to the control plane
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is healthy and accepting requests
    #[default]
    Active,
    /// Node is dead
    Dead,
}

/// Lifecycle of a pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Pipeline accepts new blocks
    #[default]
    Open,
    /// Pipeline is being torn down; no new blocks
    Closed,
}

/// Node information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node unique identifier
    pub id: NodeId,
    /// Human-readable name
    pub name: String,
    /// Node status
    pub status: NodeStatus,
    /// Weight for placement (higher = more blocks)
    pub weight: f64,
}

/// A pipeline plus the control plane's view of it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// The pipeline
    pub pipeline: Pipeline,
    /// Lifecycle state
    pub state: PipelineState,
}

/// Cluster topology: nodes and the pipelines over them
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Version number (incremented on changes)
    pub version: u64,
    nodes: HashMap<NodeId, NodeInfo>,
    pipelines: HashMap<PipelineId, PipelineInfo>,
}

impl ClusterTopology {
    /// Create a new empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a node
    pub fn upsert_node(&mut self, node: NodeInfo) {
        self.nodes.insert(node.id, node);
        self.version += 1;
    }

    /// Get a specific node by ID
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    /// Register a pipeline; every member must already be a known node
    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> bool {
        if pipeline.nodes.iter().any(|n| !self.nodes.contains_key(n)) {
            return false;
        }
        if pipeline.nodes.len() != pipeline.replication.node_count() {
            return false;
        }
        self.pipelines.insert(
            pipeline.id,
            PipelineInfo {
                pipeline,
                state: PipelineState::Open,
            },
        );
        self.version += 1;
        true
    }

    /// Change a pipeline's state
    pub fn set_pipeline_state(&mut self, id: PipelineId, state: PipelineState) -> bool {
        match self.pipelines.get_mut(&id) {
            Some(info) => {
                info.state = state;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Open pipelines of the given replication factor
    pub fn open_pipelines(
        &self,
        replication: ReplicationFactor,
    ) -> impl Iterator<Item = &PipelineInfo> {
        self.pipelines
            .values()
            .filter(move |p| p.state == PipelineState::Open && p.pipeline.replication == replication)
    }

    /// Placement weight of a pipeline: its weakest member's weight
    #[must_use]
    pub fn pipeline_weight(&self, pipeline: &Pipeline) -> f64 {
        pipeline
            .nodes
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .map(|n| n.weight)
            .fold(f64::INFINITY, f64::min)
            .min(1.0e6)
    }
}
