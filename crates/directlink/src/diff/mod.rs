//! # Diff Engine
//!
//! Computes the minimal delta bringing one remote peer up to date with a
//! [`LocalSceneIndex`].
//!
//! ```text
//!  LocalSceneIndex ──┐
//!                    ├─► do_diff ──► DeltaConsumer (open, set*, remove, close)
//!  RemoteScene ──────┘        ▲
//!       ▲                     │
//!       └──── DeltaProducer ◄─┘ (have_scene / have_element acks)
//! ```
//!
//! The [`RemoteScene`] distinguishes what was *sent* from what the peer
//! *confirmed*. Only confirmed hashes suppress a resend, so a dropped
//! connection resumes from whatever the peer acknowledged.

use std::collections::HashMap;

use crate::delta::{CloseDeltaArgs, DeltaConsumer, DeltaProducer, OpenDeltaArgs};
use crate::index::LocalSceneIndex;
use crate::types::{ElementHash, NodeId, SceneIdentifier, UNKNOWN_HASH};

/// What one peer is known to hold for one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteNodeStatus {
    /// Hash confirmed by the peer.
    pub have_hash: ElementHash,
    /// Hash of the last snapshot sent.
    pub sent_hash: ElementHash,
    /// Diff cycle of the last send.
    pub sent_cycle: u32,
}

/// Have-list of one remote peer.
#[derive(Debug, Default)]
pub struct RemoteScene {
    scene_id: SceneIdentifier,
    nodes: HashMap<NodeId, RemoteNodeStatus>,
    cycle: u32,
}

/// Counters of one diff pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// `set_element` calls emitted.
    pub sent: usize,
    /// Entries skipped because the peer already had them.
    pub skipped: usize,
    /// Ids passed to `remove_elements`.
    pub removed: usize,
    /// Entries whose node died before capture.
    pub unavailable: usize,
}

impl std::ops::AddAssign for DiffStats {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.unavailable += other.unavailable;
    }
}

impl RemoteScene {
    /// Creates an empty have-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scene this have-list was built against.
    #[must_use]
    pub const fn scene_id(&self) -> &SceneIdentifier {
        &self.scene_id
    }

    /// Status of one node.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&RemoteNodeStatus> {
        self.nodes.get(&node_id)
    }

    /// Number of nodes the peer confirmed.
    #[must_use]
    pub fn have_count(&self) -> usize {
        self.nodes.values().filter(|n| n.have_hash != UNKNOWN_HASH).count()
    }

    /// Number of diff passes run against this have-list.
    #[must_use]
    pub const fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Aligns the stored identity with `scene_id`. A guid change clears the
    /// have-list. Returns true if it was cleared.
    pub fn sync_scene_id(&mut self, scene_id: &SceneIdentifier) -> bool {
        let reset = self.scene_id.guid != scene_id.guid;
        if reset {
            tracing::debug!(
                old = %self.scene_id.guid,
                new = %scene_id.guid,
                "diff: scene guid changed, have-list cleared"
            );
            self.nodes.clear();
        }
        self.scene_id = scene_id.clone();
        reset
    }

    /// Forgets everything the peer was believed to hold.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl DeltaProducer for RemoteScene {
    fn have_scene(&mut self, scene_id: &SceneIdentifier, keep_previous_content: bool) {
        if !keep_previous_content {
            self.nodes.clear();
        }
        self.sync_scene_id(scene_id);
    }

    fn have_element(&mut self, node_id: NodeId, hash: ElementHash) {
        self.nodes.entry(node_id).or_default().have_hash = hash;
    }
}

/// Pushes to `consumer` the delta bringing `remote` up to date with `index`.
///
/// The pass is always bracketed by exactly one `open_delta` and one
/// `close_delta`, even when nothing changed.
pub fn do_diff(
    index: &LocalSceneIndex,
    remote: &mut RemoteScene,
    consumer: &mut dyn DeltaConsumer,
) -> DiffStats {
    let reset = remote.sync_scene_id(index.scene_id());
    remote.cycle = remote.cycle.wrapping_add(1);
    let cycle = remote.cycle;
    let mut stats = DiffStats::default();

    consumer.open_delta(&OpenDeltaArgs {
        scene_id: index.scene_id().clone(),
        based_on_new_scene: reset || remote.have_count() == 0,
        element_count_hint: u32::try_from(index.len()).unwrap_or(u32::MAX),
    });

    for entry in index.entries() {
        let Some(snapshot) = entry.snapshot() else {
            stats.unavailable += 1;
            continue;
        };
        let hash = snapshot.hash();
        let status = remote.nodes.entry(entry.node_id()).or_default();
        if hash != UNKNOWN_HASH && hash == status.have_hash {
            stats.skipped += 1;
            continue;
        }
        // An unacknowledged in-flight send is sent again.
        status.sent_hash = hash;
        status.sent_cycle = cycle;
        consumer.set_element(snapshot);
        stats.sent += 1;
    }

    let mut removed: Vec<NodeId> = remote
        .nodes
        .keys()
        .copied()
        .filter(|id| !index.contains(*id))
        .collect();
    if !removed.is_empty() {
        removed.sort_unstable();
        for id in &removed {
            remote.nodes.remove(id);
        }
        consumer.remove_elements(&removed);
        stats.removed = removed.len();
    }

    consumer.close_delta(&CloseDeltaArgs::default());

    tracing::debug!(
        scene = %index.scene_id().guid,
        cycle,
        sent = stats.sent,
        skipped = stats.skipped,
        removed = stats.removed,
        "diff: pass complete"
    );
    stats
}
