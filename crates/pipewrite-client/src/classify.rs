//! Replication failure classification
//!
//! Maps a `ReplicationFailure` seen by a block session to what the writer
//! should do about it. The most specific culprit wins: a node is preferred
//! over a container, and a container over a whole pipeline.

use crate::exclude_list::ExcludeList;
use pipewrite_common::{AllocatedBlock, ContainerId, NodeId, PipelineId, ReplicationFailure};

/// Targets to exclude before allocating a replacement block
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exclusion {
    /// Individual pipeline members; the pipeline kept its quorum
    Nodes(Vec<NodeId>),
    /// The block's container
    Container(ContainerId),
    /// The whole pipeline, plus any of its members known to be unreachable
    Pipeline {
        pipeline: PipelineId,
        nodes: Vec<NodeId>,
    },
}

impl Exclusion {
    /// Record this exclusion; returns newly added `(containers, pipelines, nodes)`
    pub fn apply(&self, list: &ExcludeList) -> (u64, u64, u64) {
        match self {
            Self::Nodes(nodes) => (0, 0, list.add_nodes(nodes) as u64),
            Self::Container(container) => (u64::from(list.add_container(*container)), 0, 0),
            Self::Pipeline { pipeline, nodes } => (
                0,
                u64::from(list.add_pipeline(*pipeline)),
                list.add_nodes(nodes) as u64,
            ),
        }
    }

    /// Short label used in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Nodes(_) => "nodes",
            Self::Container(_) => "container",
            Self::Pipeline { .. } => "pipeline",
        }
    }
}

/// What the writer does after a failed flush
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Keep the session and resend its unacknowledged bytes
    RetryInPlace,
    /// Abandon the session, exclude, and replay onto a new block
    Replace(Exclusion),
}

/// Decide how to recover from `failure` on `block`
///
/// `in_place_attempts` is how many in-place retries the current session
/// has already used. Recorded node sets are always members of the block's
/// pipeline.
#[must_use]
pub fn classify(
    failure: &ReplicationFailure,
    block: &AllocatedBlock,
    in_place_attempts: u32,
    max_in_place_retries: u32,
) -> RecoveryAction {
    let pipeline = &block.pipeline;
    match failure {
        ReplicationFailure::NodeUnavailable { nodes } => {
            let members = pipeline.members_of(nodes);
            if !members.is_empty() && pipeline.has_quorum_without(&members) {
                RecoveryAction::Replace(Exclusion::Nodes(members))
            } else {
                // Quorum lost, or the report named no member we can blame
                RecoveryAction::Replace(Exclusion::Pipeline {
                    pipeline: pipeline.id,
                    nodes: members,
                })
            }
        }
        ReplicationFailure::ContainerClosed { container } => {
            RecoveryAction::Replace(Exclusion::Container(*container))
        }
        ReplicationFailure::PipelineFailed { unreachable, .. } => {
            RecoveryAction::Replace(Exclusion::Pipeline {
                pipeline: pipeline.id,
                nodes: pipeline.members_of(unreachable),
            })
        }
        ReplicationFailure::Transient { .. } if in_place_attempts < max_in_place_retries => {
            RecoveryAction::RetryInPlace
        }
        ReplicationFailure::Transient { .. } => RecoveryAction::Replace(Exclusion::Pipeline {
            pipeline: pipeline.id,
            nodes: Vec::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewrite_common::{BlockId, Pipeline, ReplicationFactor};

    fn block() -> AllocatedBlock {
        AllocatedBlock {
            block_id: BlockId::new(ContainerId::new(11), 4),
            pipeline: Pipeline::new(
                PipelineId::new(),
                vec![NodeId::new(), NodeId::new(), NodeId::new()],
                ReplicationFactor::Three,
            ),
            capacity: 4096,
        }
    }

    #[test]
    fn test_single_node_loss_excludes_node() {
        let block = block();
        let failure = ReplicationFailure::NodeUnavailable {
            nodes: vec![block.pipeline.nodes[1]],
        };
        assert_eq!(
            classify(&failure, &block, 0, 3),
            RecoveryAction::Replace(Exclusion::Nodes(vec![block.pipeline.nodes[1]]))
        );
    }

    #[test]
    fn test_quorum_loss_escalates_to_pipeline() {
        let block = block();
        let failure = ReplicationFailure::NodeUnavailable {
            nodes: vec![block.pipeline.nodes[0], block.pipeline.nodes[2]],
        };
        assert_eq!(
            classify(&failure, &block, 0, 3),
            RecoveryAction::Replace(Exclusion::Pipeline {
                pipeline: block.pipeline.id,
                nodes: vec![block.pipeline.nodes[0], block.pipeline.nodes[2]],
            })
        );
    }

    #[test]
    fn test_foreign_nodes_are_ignored() {
        let block = block();
        let stranger = NodeId::new();
        let failure = ReplicationFailure::NodeUnavailable {
            nodes: vec![stranger, block.pipeline.nodes[0]],
        };
        assert_eq!(
            classify(&failure, &block, 0, 3),
            RecoveryAction::Replace(Exclusion::Nodes(vec![block.pipeline.nodes[0]]))
        );

        let only_strangers = ReplicationFailure::NodeUnavailable {
            nodes: vec![stranger],
        };
        assert!(matches!(
            classify(&only_strangers, &block, 0, 3),
            RecoveryAction::Replace(Exclusion::Pipeline { ref nodes, .. }) if nodes.is_empty()
        ));
    }

    #[test]
    fn test_container_closed() {
        let block = block();
        let failure = ReplicationFailure::ContainerClosed {
            container: block.container_id(),
        };
        assert_eq!(
            classify(&failure, &block, 0, 3),
            RecoveryAction::Replace(Exclusion::Container(ContainerId::new(11)))
        );
    }

    #[test]
    fn test_pipeline_failure_nodes_are_subset() {
        let block = block();
        let failure = ReplicationFailure::PipelineFailed {
            pipeline: block.pipeline.id,
            unreachable: vec![NodeId::new(), block.pipeline.nodes[2]],
        };
        let RecoveryAction::Replace(Exclusion::Pipeline { pipeline, nodes }) =
            classify(&failure, &block, 0, 3)
        else {
            panic!("expected pipeline exclusion");
        };
        assert_eq!(pipeline, block.pipeline.id);
        assert_eq!(nodes, vec![block.pipeline.nodes[2]]);
    }

    #[test]
    fn test_transient_retries_then_escalates() {
        let block = block();
        let failure = ReplicationFailure::transient("busy");
        assert_eq!(classify(&failure, &block, 0, 2), RecoveryAction::RetryInPlace);
        assert_eq!(classify(&failure, &block, 1, 2), RecoveryAction::RetryInPlace);
        assert_eq!(
            classify(&failure, &block, 2, 2),
            RecoveryAction::Replace(Exclusion::Pipeline {
                pipeline: block.pipeline.id,
                nodes: vec![],
            })
        );
    }

    #[test]
    fn test_apply_reports_new_entries() {
        let block = block();
        let list = ExcludeList::new();
        let exclusion = Exclusion::Pipeline {
            pipeline: block.pipeline.id,
            nodes: vec![block.pipeline.nodes[0]],
        };
        assert_eq!(exclusion.apply(&list), (0, 1, 1));
        assert_eq!(exclusion.apply(&list), (0, 0, 0));
        assert_eq!(
            Exclusion::Container(block.container_id()).apply(&list),
            (1, 0, 0)
        );
    }
}
