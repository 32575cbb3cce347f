//! # Scene Graph Capabilities
//!
//! The protocol never owns a scene graph. It reads nodes through the
//! [`SceneNode`] capability and exposes scenes to the network through
//! [`SceneProvider`].
//!
//! [`memory`] holds a thread-safe in-memory graph implementing both sides,
//! used by the reconstructor, the demo binary and the tests.

pub mod memory;
mod parameters;

pub use memory::{MemoryNode, MemoryScene, MemorySceneProvider};
pub use parameters::{ParameterStore, ParameterValue};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::delta::DeltaConsumer;
use crate::types::{NodeId, SceneIdentifier};

/// Per-scene state shared by every node of one graph.
///
/// Allocates node ids and holds the scene identity.
#[derive(Debug)]
pub struct SceneSharedState {
    scene_id: RwLock<SceneIdentifier>,
    last_id: AtomicU32,
}

impl SceneSharedState {
    /// Creates a shared state with a fresh scene guid.
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_identifier(SceneIdentifier::new(display_name))
    }

    /// Creates a shared state for a known identity.
    #[must_use]
    pub fn with_identifier(scene_id: SceneIdentifier) -> Self {
        Self {
            scene_id: RwLock::new(scene_id),
            last_id: AtomicU32::new(0),
        }
    }

    /// Returns a copy of the scene identity.
    #[must_use]
    pub fn scene_id(&self) -> SceneIdentifier {
        self.scene_id.read().clone()
    }

    /// Allocates the next node id. Never returns 0.
    pub fn make_id(&self) -> NodeId {
        loop {
            let id = self.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Makes sure ids up to `id` are never handed out again.
    pub fn reserve_id(&self, id: NodeId) {
        self.last_id.fetch_max(id, Ordering::Relaxed);
    }

    /// Gives the scene a new guid, forcing a full resync on every peer.
    pub fn regenerate_guid(&self) {
        let mut scene_id = self.scene_id.write();
        let name = std::mem::take(&mut scene_id.display_name);
        *scene_id = SceneIdentifier::new(name);
    }
}

/// One named group of outgoing references of a node.
#[derive(Clone)]
pub struct ReferenceProxy {
    name: String,
    nodes: Vec<Arc<dyn SceneNode>>,
}

impl ReferenceProxy {
    /// Creates a proxy over the given nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<dyn SceneNode>>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of referenced nodes.
    #[must_use]
    pub fn num(&self) -> usize {
        self.nodes.len()
    }

    /// Referenced node at `index`.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&Arc<dyn SceneNode>> {
        self.nodes.get(index)
    }
}

/// Read access to one live scene graph node.
pub trait SceneNode: Send + Sync {
    /// Node id, `0` when not yet registered with a scene.
    fn node_id(&self) -> NodeId;

    /// Assigns the node id.
    fn set_node_id(&self, id: NodeId);

    /// Copy of the node's attributes.
    fn store(&self) -> ParameterStore;

    /// Number of reference groups.
    fn reference_proxy_count(&self) -> usize;

    /// Reference group at `index`.
    fn reference_proxy(&self, index: usize) -> Option<ReferenceProxy>;

    /// Shared scene state, if the node is registered with one.
    fn shared_state(&self) -> Option<Arc<SceneSharedState>>;

    /// Registers the node with a scene. Returns false if refused.
    fn set_shared_state(&self, state: Arc<SceneSharedState>) -> bool;

    /// Creates a new shared state suitable for a graph rooted at this node.
    fn make_shared_state(&self) -> Option<Arc<SceneSharedState>> {
        Some(Arc::new(SceneSharedState::new(String::new())))
    }

    /// Records that `referencer` points to this node.
    fn register_referencer(&self, referencer: NodeId);
}

/// What a destination knows about a given scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneStatus {
    /// The scene cannot be received here.
    None,
    /// The scene is unknown but can be created.
    CanCreateScene,
    /// The scene already exists here.
    SceneExists,
}

/// A destination-side scene host, exposed to the transport.
pub trait SceneProvider: Send + Sync {
    /// Reports the local status of `scene_id`.
    fn get_scene_status(&self, scene_id: &SceneIdentifier) -> SceneStatus;

    /// Returns the consumer that applies deltas for `scene_id`.
    fn get_delta_consumer(&self, scene_id: &SceneIdentifier) -> Option<Box<dyn DeltaConsumer>>;

    /// Returns true if another stream may be connected.
    fn can_open_new_connection(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let state = SceneSharedState::new("scene");
        assert_eq!(state.make_id(), 1);
        assert_eq!(state.make_id(), 2);
    }

    #[test]
    fn test_reserved_ids_are_skipped() {
        let state = SceneSharedState::new("scene");
        state.reserve_id(10);
        assert_eq!(state.make_id(), 11);
        state.reserve_id(3);
        assert_eq!(state.make_id(), 12);
    }

    #[test]
    fn test_regenerate_guid_keeps_name() {
        let state = SceneSharedState::new("atrium");
        let before = state.scene_id();
        state.regenerate_guid();
        let after = state.scene_id();
        assert_ne!(before.guid, after.guid);
        assert_eq!(after.display_name, "atrium");
    }
}
