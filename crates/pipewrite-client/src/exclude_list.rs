//! Per-key exclusion tracking
//!
//! Every allocation made on behalf of a key carries a snapshot of the key's
//! exclusions so the control plane never hands back a container, pipeline
//! or node the writer has already seen fail. The list lives for one key
//! write and is cleared when the key is committed.

use parking_lot::Mutex;
use pipewrite_common::{ContainerId, ExcludeSnapshot, NodeId, PipelineId};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Entries {
    containers: HashMap<ContainerId, Instant>,
    pipelines: HashMap<PipelineId, Instant>,
    nodes: HashMap<NodeId, Instant>,
}

/// Known-bad containers, pipelines and nodes for one key write
///
/// Shared as `Arc<ExcludeList>` between the writer and its allocation
/// client. Each call is atomic; adding an entry that is already present
/// only refreshes its timestamp.
#[derive(Default)]
pub struct ExcludeList {
    entries: Mutex<Entries>,
    expiry: Option<Duration>,
}

impl ExcludeList {
    /// Create a list whose entries never expire
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list whose entries disappear `expiry` after they were added
    #[must_use]
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            expiry: Some(expiry),
        }
    }

    /// Expiry window, if any
    #[must_use]
    pub const fn expiry(&self) -> Option<Duration> {
        self.expiry
    }

    /// Exclude a container. Returns `true` if it was not already excluded.
    pub fn add_container(&self, id: ContainerId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = self.is_live(entries.containers.get(&id), now);
        entries.containers.insert(id, now);
        !live
    }

    /// Exclude a pipeline. Returns `true` if it was not already excluded.
    pub fn add_pipeline(&self, id: PipelineId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = self.is_live(entries.pipelines.get(&id), now);
        entries.pipelines.insert(id, now);
        !live
    }

    /// Exclude a node. Returns `true` if it was not already excluded.
    pub fn add_node(&self, id: NodeId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = self.is_live(entries.nodes.get(&id), now);
        entries.nodes.insert(id, now);
        !live
    }

    /// Exclude several nodes. Returns how many were newly excluded.
    pub fn add_nodes<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut added = 0;
        for id in ids {
            if !self.is_live(entries.nodes.get(id), now) {
                added += 1;
            }
            entries.nodes.insert(*id, now);
        }
        added
    }

    /// Whether the container is currently excluded
    #[must_use]
    pub fn contains_container(&self, id: ContainerId) -> bool {
        self.is_live(self.entries.lock().containers.get(&id), Instant::now())
    }

    /// Whether the pipeline is currently excluded
    #[must_use]
    pub fn contains_pipeline(&self, id: PipelineId) -> bool {
        self.is_live(self.entries.lock().pipelines.get(&id), Instant::now())
    }

    /// Whether the node is currently excluded
    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.is_live(self.entries.lock().nodes.get(&id), Instant::now())
    }

    /// Copy of the live entries
    #[must_use]
    pub fn snapshot(&self) -> ExcludeSnapshot {
        let now = Instant::now();
        let entries = self.entries.lock();
        ExcludeSnapshot {
            containers: self.live_keys(&entries.containers, now),
            pipelines: self.live_keys(&entries.pipelines, now),
            nodes: self.live_keys(&entries.nodes, now),
        }
    }

    /// True when nothing is currently excluded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Forget every entry
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.containers.clear();
        entries.pipelines.clear();
        entries.nodes.clear();
    }

    fn is_live(&self, added: Option<&Instant>, now: Instant) -> bool {
        match (added, self.expiry) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(added), Some(expiry)) => now.saturating_duration_since(*added) < expiry,
        }
    }

    fn live_keys<K: Copy + Ord + Hash>(
        &self,
        map: &HashMap<K, Instant>,
        now: Instant,
    ) -> std::collections::BTreeSet<K> {
        map.iter()
            .filter(|(_, added)| self.is_live(Some(added), now))
            .map(|(k, _)| *k)
            .collect()
    }
}

impl std::fmt::Debug for ExcludeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ExcludeList")
            .field("containers", &snapshot.containers)
            .field("pipelines", &snapshot.pipelines)
            .field("nodes", &snapshot.nodes)
            .field("expiry", &self.expiry)
            .finish()
    }
}
