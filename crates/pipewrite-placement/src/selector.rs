//! Exclusion-aware pipeline selection
//!
//! Pipelines are ranked with Highest Random Weight hashing: each candidate
//! scores `xxh64(pipeline_id, xxh64(seed))` scaled by the weight of its
//! weakest member, and the highest score wins. The ranking for a seed is
//! stable, so excluding the winner moves allocation to the runner-up and
//! leaves every other choice untouched.

use crate::topology::{ClusterTopology, NodeStatus};
use parking_lot::RwLock;
use pipewrite_common::{ExcludeSnapshot, Pipeline, ReplicationFactor};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Placement failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no eligible {replication} pipeline ({open} open, {excluded} excluded)")]
    NoEligiblePipeline {
        replication: ReplicationFactor,
        open: usize,
        excluded: usize,
    },
}

/// Picks pipelines for new blocks
pub struct PipelineSelector {
    topology: Arc<RwLock<ClusterTopology>>,
}

impl PipelineSelector {
    /// Create a selector over a shared topology
    #[must_use]
    pub const fn new(topology: Arc<RwLock<ClusterTopology>>) -> Self {
        Self { topology }
    }

    /// All eligible pipelines for `seed`, best first
    ///
    /// A pipeline is eligible when it is open, has the requested replication
    /// factor, every member is active, and neither the pipeline nor any
    /// member appears in `exclude`.
    #[must_use]
    pub fn rank(
        &self,
        seed: &[u8],
        replication: ReplicationFactor,
        exclude: &ExcludeSnapshot,
    ) -> Vec<Pipeline> {
        let topology = self.topology.read();
        let seed_hash = xxhash_rust::xxh64::xxh64(seed, 0);

        let mut scored: Vec<(u64, Pipeline)> = topology
            .open_pipelines(replication)
            .filter(|info| !exclude.excludes_pipeline(&info.pipeline))
            .filter(|info| {
                info.pipeline.nodes.iter().all(|n| {
                    topology
                        .get_node(*n)
                        .is_some_and(|node| node.status == NodeStatus::Active)
                })
            })
            .map(|info| {
                let hash = xxhash_rust::xxh64::xxh64(info.pipeline.id.as_bytes(), seed_hash);
                // Scale by weight * 1000 for precision
                let weight_factor = (topology.pipeline_weight(&info.pipeline) * 1000.0) as u64;
                (hash.wrapping_mul(weight_factor), info.pipeline.clone())
            })
            .collect();

        // Ties broken by pipeline id so the order is total
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Best eligible pipeline for `seed`
    pub fn select(
        &self,
        seed: &[u8],
        replication: ReplicationFactor,
        exclude: &ExcludeSnapshot,
    ) -> Result<Pipeline, PlacementError> {
        if let Some(pipeline) = self.rank(seed, replication, exclude).into_iter().next() {
            debug!(pipeline = %pipeline.id, "selected pipeline");
            return Ok(pipeline);
        }

        let topology = self.topology.read();
        let open = topology.open_pipelines(replication).count();
        let excluded = topology
            .open_pipelines(replication)
            .filter(|info| exclude.excludes_pipeline(&info.pipeline))
            .count();
        Err(PlacementError::NoEligiblePipeline {
            replication,
            open,
            excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeInfo, PipelineState};
    use pipewrite_common::{NodeId, PipelineId};
    use rand::Rng;

    fn cluster(node_count: usize) -> (Arc<RwLock<ClusterTopology>>, Vec<Pipeline>) {
        let mut topology = ClusterTopology::new();
        let ids: Vec<NodeId> = (0..node_count).map(|_| NodeId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            topology.upsert_node(NodeInfo {
                id: *id,
                name: format!("dn{i}"),
                status: NodeStatus::Active,
                weight: 1.0,
            });
        }

        let pipelines: Vec<Pipeline> = ids
            .chunks_exact(3)
            .map(|members| {
                Pipeline::new(PipelineId::new(), members.to_vec(), ReplicationFactor::Three)
            })
            .collect();
        for p in &pipelines {
            assert!(topology.add_pipeline(p.clone()));
        }
        (Arc::new(RwLock::new(topology)), pipelines)
    }

    #[test]
    fn test_select_is_deterministic() {
        let (topology, _) = cluster(9);
        let selector = PipelineSelector::new(topology);
        let exclude = ExcludeSnapshot::default();

        let first = selector
            .select(b"vol/bucket/key", ReplicationFactor::Three, &exclude)
            .unwrap();
        for _ in 0..10 {
            let again = selector
                .select(b"vol/bucket/key", ReplicationFactor::Three, &exclude)
                .unwrap();
            assert_eq!(first.id, again.id);
        }
    }

    #[test]
    fn test_excluding_winner_moves_to_runner_up() {
        let (topology, _) = cluster(9);
        let selector = PipelineSelector::new(topology);
        let ranked = selector.rank(b"key", ReplicationFactor::Three, &ExcludeSnapshot::default());
        assert_eq!(ranked.len(), 3);

        let mut exclude = ExcludeSnapshot::default();
        exclude.pipelines.insert(ranked[0].id);
        let next = selector
            .select(b"key", ReplicationFactor::Three, &exclude)
            .unwrap();
        assert_eq!(next.id, ranked[1].id);
    }

    #[test]
    fn test_excluded_node_removes_its_pipelines() {
        let (topology, pipelines) = cluster(9);
        let selector = PipelineSelector::new(topology);
        let mut rng = rand::thread_rng();

        let mut exclude = ExcludeSnapshot::default();
        let victim = pipelines[1].nodes[rng.gen_range(0..3)];
        exclude.nodes.insert(victim);

        for i in 0..50 {
            let seed = format!("key-{i}");
            let chosen = selector
                .select(seed.as_bytes(), ReplicationFactor::Three, &exclude)
                .unwrap();
            assert!(!chosen.contains(&victim));
        }
    }

    #[test]
    fn test_closed_and_inactive_pipelines_skipped() {
        let (topology, pipelines) = cluster(6);
        topology
            .write()
            .set_pipeline_state(pipelines[0].id, PipelineState::Closed);
        let mut dead = topology.read().get_node(pipelines[1].nodes[0]).cloned().unwrap();
        dead.status = NodeStatus::Dead;
        topology.write().upsert_node(dead);

        let selector = PipelineSelector::new(topology);
        let err = selector
            .select(b"key", ReplicationFactor::Three, &ExcludeSnapshot::default())
            .unwrap_err();
        assert!(matches!(err, PlacementError::NoEligiblePipeline { open: 1, .. }));
    }

    #[test]
    fn test_all_excluded_reports_counts() {
        let (topology, pipelines) = cluster(6);
        let selector = PipelineSelector::new(topology);
        let mut exclude = ExcludeSnapshot::default();
        for p in &pipelines {
            exclude.pipelines.insert(p.id);
        }

        let err = selector
            .select(b"key", ReplicationFactor::Three, &exclude)
            .unwrap_err();
        assert_eq!(
            err,
            PlacementError::NoEligiblePipeline {
                replication: ReplicationFactor::Three,
                open: 2,
                excluded: 2,
            }
        );
    }

    #[test]
    fn test_spread_across_pipelines() {
        let (topology, pipelines) = cluster(9);
        let selector = PipelineSelector::new(topology);
        let exclude = ExcludeSnapshot::default();

        let mut hits = std::collections::HashMap::new();
        for i in 0..300 {
            let seed = format!("bucket/object-{i}");
            let chosen = selector
                .select(seed.as_bytes(), ReplicationFactor::Three, &exclude)
                .unwrap();
            *hits.entry(chosen.id).or_insert(0usize) += 1;
        }
        // Every pipeline should receive some keys
        assert_eq!(hits.len(), pipelines.len());
    }
}
