//! # In-Memory Scene Graph
//!
//! A small thread-safe graph implementing [`SceneNode`] and
//! [`SceneProvider`].
//!
//! The [`MemoryScene`] owns its nodes; nodes point to each other through
//! weak references, so reference cycles never leak.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::{
    ParameterStore, ParameterValue, ReferenceProxy, SceneNode, SceneProvider, SceneSharedState,
    SceneStatus,
};
use crate::delta::{DeltaConsumer, SceneReconstructor};
use crate::types::{ElementHash, Guid, NodeId, SceneIdentifier, INVALID_NODE_ID};

/// Parameter used by [`MemoryNode::new`] to hold the node name.
pub const NAME_PARAMETER: &str = "name";

struct ReferenceGroup {
    name: String,
    nodes: Vec<Weak<MemoryNode>>,
}

#[derive(Default)]
struct NodeInner {
    id: NodeId,
    store: ParameterStore,
    groups: Vec<ReferenceGroup>,
    shared: Option<Arc<SceneSharedState>>,
    referencers: BTreeSet<NodeId>,
}

/// A node of a [`MemoryScene`].
#[derive(Default)]
pub struct MemoryNode {
    inner: RwLock<NodeInner>,
}

impl MemoryNode {
    /// Creates a detached node carrying a `name` parameter.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        let node = Self::default();
        node.inner.write().store.set(NAME_PARAMETER, name);
        Arc::new(node)
    }

    /// Node id, `0` while detached.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.read().id
    }

    /// Value of the `name` parameter.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        match self.inner.read().store.get(NAME_PARAMETER) {
            Some(ParameterValue::Text(name)) => Some(name.clone()),
            _ => None,
        }
    }

    /// Sets one parameter.
    pub fn set_parameter(&self, name: &str, value: impl Into<ParameterValue>) {
        self.inner.write().store.set(name, value);
    }

    /// Reads one parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<ParameterValue> {
        self.inner.read().store.get(name).cloned()
    }

    /// Replaces every parameter at once.
    pub fn replace_store(&self, store: ParameterStore) {
        self.inner.write().store = store;
    }

    /// Appends a reference to `target` in group `group`, creating the group.
    pub fn add_reference(&self, group: &str, target: &Arc<Self>) {
        let mut inner = self.inner.write();
        let weak = Arc::downgrade(target);
        if let Some(existing) = inner.groups.iter_mut().find(|g| g.name == group) {
            existing.nodes.push(weak);
        } else {
            inner.groups.push(ReferenceGroup {
                name: group.to_owned(),
                nodes: vec![weak],
            });
        }
    }

    /// Replaces the content of group `group`, creating the group.
    pub fn set_references(&self, group: &str, targets: &[Arc<Self>]) {
        let mut inner = self.inner.write();
        let nodes: Vec<_> = targets.iter().map(Arc::downgrade).collect();
        if let Some(existing) = inner.groups.iter_mut().find(|g| g.name == group) {
            existing.nodes = nodes;
        } else {
            inner.groups.push(ReferenceGroup {
                name: group.to_owned(),
                nodes,
            });
        }
    }

    /// Removes every reference group.
    pub fn clear_references(&self) {
        self.inner.write().groups.clear();
    }

    /// Live nodes referenced by group `group`.
    #[must_use]
    pub fn references(&self, group: &str) -> Vec<Arc<Self>> {
        self.inner
            .read()
            .groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.nodes.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Group names and referenced ids, in declaration order.
    #[must_use]
    pub fn reference_ids(&self) -> Vec<(String, Vec<NodeId>)> {
        self.inner
            .read()
            .groups
            .iter()
            .map(|g| {
                let ids = g
                    .nodes
                    .iter()
                    .filter_map(Weak::upgrade)
                    .map(|n| n.id())
                    .collect();
                (g.name.clone(), ids)
            })
            .collect()
    }

    /// Ids of the nodes that reached this one during indexing.
    #[must_use]
    pub fn referencers(&self) -> Vec<NodeId> {
        self.inner.read().referencers.iter().copied().collect()
    }
}

impl SceneNode for MemoryNode {
    fn node_id(&self) -> NodeId {
        self.id()
    }

    fn set_node_id(&self, id: NodeId) {
        self.inner.write().id = id;
    }

    fn store(&self) -> ParameterStore {
        self.inner.read().store.clone()
    }

    fn reference_proxy_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    fn reference_proxy(&self, index: usize) -> Option<ReferenceProxy> {
        let inner = self.inner.read();
        let group = inner.groups.get(index)?;
        let nodes = group
            .nodes
            .iter()
            .filter_map(Weak::upgrade)
            .map(|n| n as Arc<dyn SceneNode>)
            .collect();
        Some(ReferenceProxy::new(group.name.clone(), nodes))
    }

    fn shared_state(&self) -> Option<Arc<SceneSharedState>> {
        self.inner.read().shared.clone()
    }

    fn set_shared_state(&self, state: Arc<SceneSharedState>) -> bool {
        let mut inner = self.inner.write();
        match &inner.shared {
            Some(current) if !Arc::ptr_eq(current, &state) => false,
            _ => {
                inner.shared = Some(state);
                true
            }
        }
    }

    fn make_shared_state(&self) -> Option<Arc<SceneSharedState>> {
        let name = self.name().unwrap_or_default();
        Some(Arc::new(SceneSharedState::new(name)))
    }

    fn register_referencer(&self, referencer: NodeId) {
        if referencer != INVALID_NODE_ID {
            self.inner.write().referencers.insert(referencer);
        }
    }
}

/// Owner of a set of [`MemoryNode`]s sharing one scene identity.
///
/// A reconstructed scene also keeps the hash of the snapshot last applied
/// to each node, so a new stream can announce what is already held.
pub struct MemoryScene {
    shared: Arc<SceneSharedState>,
    nodes: BTreeMap<NodeId, Arc<MemoryNode>>,
    hashes: BTreeMap<NodeId, ElementHash>,
}

impl MemoryScene {
    /// Creates an empty scene with a fresh identity.
    #[must_use]
    pub fn new(display_name: &str) -> Self {
        Self::with_identifier(SceneIdentifier::new(display_name))
    }

    /// Creates an empty scene for a known identity.
    #[must_use]
    pub fn with_identifier(scene_id: SceneIdentifier) -> Self {
        Self {
            shared: Arc::new(SceneSharedState::with_identifier(scene_id)),
            nodes: BTreeMap::new(),
            hashes: BTreeMap::new(),
        }
    }

    /// Current scene identity.
    #[must_use]
    pub fn scene_id(&self) -> SceneIdentifier {
        self.shared.scene_id()
    }

    /// Shared state of this scene.
    #[must_use]
    pub fn shared_state(&self) -> &Arc<SceneSharedState> {
        &self.shared
    }

    /// Creates and registers a new node with a freshly allocated id.
    pub fn create_node(&mut self, name: &str) -> Arc<MemoryNode> {
        let node = MemoryNode::new(name);
        let id = self.shared.make_id();
        node.set_node_id(id);
        node.set_shared_state(Arc::clone(&self.shared));
        self.nodes.insert(id, Arc::clone(&node));
        node
    }

    /// Returns the node with `id`, creating an empty one if missing.
    pub fn get_or_insert(&mut self, id: NodeId) -> Arc<MemoryNode> {
        let shared = &self.shared;
        Arc::clone(self.nodes.entry(id).or_insert_with(|| {
            shared.reserve_id(id);
            let node = Arc::new(MemoryNode::default());
            node.set_node_id(id);
            node.set_shared_state(Arc::clone(shared));
            node
        }))
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Arc<MemoryNode>> {
        self.nodes.get(&id)
    }

    /// First node whose `name` parameter equals `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<MemoryNode>> {
        self.nodes
            .values()
            .find(|n| n.name().as_deref() == Some(name))
    }

    /// Removes a node. References to it die with it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Arc<MemoryNode>> {
        self.hashes.remove(&id);
        self.nodes.remove(&id)
    }

    /// Records the hash of the snapshot applied to node `id`.
    pub fn record_hash(&mut self, id: NodeId, hash: ElementHash) {
        if self.nodes.contains_key(&id) {
            self.hashes.insert(id, hash);
        }
    }

    /// Nodes with a recorded snapshot hash, in id order.
    #[must_use]
    pub fn held_elements(&self) -> Vec<(NodeId, ElementHash)> {
        self.hashes.iter().map(|(id, hash)| (*id, *hash)).collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the scene holds no node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Arc<MemoryNode>)> {
        self.nodes.iter().map(|(id, n)| (*id, n))
    }

    /// Drops every node and adopts `scene_id`.
    pub fn reset(&mut self, scene_id: SceneIdentifier) {
        self.nodes.clear();
        self.hashes.clear();
        self.shared = Arc::new(SceneSharedState::with_identifier(scene_id));
    }
}

/// Destination-side host of reconstructed [`MemoryScene`]s, one per scene guid.
pub struct MemorySceneProvider {
    scenes: Mutex<HashMap<Guid, Arc<Mutex<MemoryScene>>>>,
    accepting: AtomicBool,
}

impl MemorySceneProvider {
    /// Creates a provider accepting connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scenes: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Allows or refuses new streams.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    /// Scene reconstructed for `guid`.
    #[must_use]
    pub fn scene(&self, guid: Guid) -> Option<Arc<Mutex<MemoryScene>>> {
        self.scenes.lock().get(&guid).cloned()
    }

    /// Every hosted scene.
    #[must_use]
    pub fn scenes(&self) -> Vec<Arc<Mutex<MemoryScene>>> {
        self.scenes.lock().values().cloned().collect()
    }
}

impl Default for MemorySceneProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneProvider for MemorySceneProvider {
    fn get_scene_status(&self, scene_id: &SceneIdentifier) -> SceneStatus {
        if self.scenes.lock().contains_key(&scene_id.guid) {
            SceneStatus::SceneExists
        } else if self.accepting.load(Ordering::Relaxed) {
            SceneStatus::CanCreateScene
        } else {
            SceneStatus::None
        }
    }

    fn get_delta_consumer(&self, scene_id: &SceneIdentifier) -> Option<Box<dyn DeltaConsumer>> {
        let status = self.get_scene_status(scene_id);
        if status == SceneStatus::None {
            return None;
        }
        let scene = Arc::clone(
            self.scenes
                .lock()
                .entry(scene_id.guid)
                .or_insert_with(|| Arc::new(Mutex::new(MemoryScene::with_identifier(scene_id.clone())))),
        );
        Some(Box::new(SceneReconstructor::new(scene)))
    }

    fn can_open_new_connection(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node_registers_with_scene() {
        let mut scene = MemoryScene::new("scene");
        let a = scene.create_node("a");
        let b = scene.create_node("b");
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert!(a.shared_state().is_some());
        assert_eq!(scene.find_by_name("b").map(|n| n.id()), Some(2));
    }

    #[test]
    fn test_removed_node_disappears_from_references() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let child = scene.create_node("child");
        root.add_reference("children", &child);
        assert_eq!(root.reference_ids(), vec![("children".to_owned(), vec![2])]);

        drop(child);
        scene.remove_node(2);
        assert_eq!(root.reference_ids(), vec![("children".to_owned(), vec![])]);
    }

    #[test]
    fn test_held_elements_follow_nodes() {
        let mut scene = MemoryScene::new("scene");
        scene.get_or_insert(3);
        scene.get_or_insert(5);
        scene.record_hash(3, 30);
        scene.record_hash(5, 50);
        scene.record_hash(9, 90);
        assert_eq!(scene.held_elements(), vec![(3, 30), (5, 50)]);

        scene.remove_node(3);
        assert_eq!(scene.held_elements(), vec![(5, 50)]);

        scene.reset(SceneIdentifier::new("again"));
        assert!(scene.held_elements().is_empty());
    }

    #[test]
    fn test_foreign_shared_state_is_refused() {
        let mut first = MemoryScene::new("first");
        let second = MemoryScene::new("second");
        let node = first.create_node("n");
        assert!(!node.set_shared_state(Arc::clone(second.shared_state())));
        assert!(node.set_shared_state(Arc::clone(first.shared_state())));
    }

    #[test]
    fn test_provider_status_follows_scenes() {
        let provider = MemorySceneProvider::new();
        let id = SceneIdentifier::new("remote");
        assert_eq!(provider.get_scene_status(&id), SceneStatus::CanCreateScene);
        assert!(provider.get_delta_consumer(&id).is_some());
        assert_eq!(provider.get_scene_status(&id), SceneStatus::SceneExists);

        provider.set_accepting(false);
        assert!(!provider.can_open_new_connection());
        assert_eq!(
            provider.get_scene_status(&SceneIdentifier::new("other")),
            SceneStatus::None
        );
    }
}
