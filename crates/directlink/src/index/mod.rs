//! # Local Scene Index
//!
//! Deduplicated, depth-first index of every node reachable from a root.
//!
//! The index holds weak references only; it never keeps the live graph
//! alive. Snapshots are captured lazily per entry, or all at once with
//! [`LocalSceneIndex::capture_all`] on the thread that owns the graph.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use crate::scene::{SceneNode, SceneSharedState};
use crate::snapshot::ElementSnapshot;
use crate::types::{ElementHash, NodeId, SceneIdentifier, INVALID_NODE_ID, UNKNOWN_HASH};

/// One indexed node.
pub struct IndexEntry {
    node_id: NodeId,
    node: Weak<dyn SceneNode>,
    snapshot: OnceLock<Arc<ElementSnapshot>>,
}

impl IndexEntry {
    /// Id of the indexed node.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Live node, if it still exists.
    #[must_use]
    pub fn node(&self) -> Option<Arc<dyn SceneNode>> {
        self.node.upgrade()
    }

    /// Snapshot hash, or [`UNKNOWN_HASH`] if not captured yet.
    #[must_use]
    pub fn cached_hash(&self) -> ElementHash {
        self.snapshot.get().map_or(UNKNOWN_HASH, |s| s.hash())
    }

    /// Snapshot of the node, captured on first call.
    ///
    /// Returns `None` if the node died before it was ever captured.
    pub fn snapshot(&self) -> Option<Arc<ElementSnapshot>> {
        if let Some(snapshot) = self.snapshot.get() {
            return Some(Arc::clone(snapshot));
        }
        let node = self.node.upgrade()?;
        let snapshot = self
            .snapshot
            .get_or_init(|| Arc::new(ElementSnapshot::capture(node.as_ref())));
        Some(Arc::clone(snapshot))
    }
}

/// Index of one scene, in traversal order.
#[derive(Default)]
pub struct LocalSceneIndex {
    scene_id: SceneIdentifier,
    entries: Vec<IndexEntry>,
    positions: HashMap<NodeId, usize>,
}

impl LocalSceneIndex {
    /// Identity of the indexed scene.
    #[must_use]
    pub const fn scene_id(&self) -> &SceneIdentifier {
        &self.scene_id
    }

    /// Number of indexed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in traversal order.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Entry for `node_id`.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<&IndexEntry> {
        self.positions.get(&node_id).map(|&i| &self.entries[i])
    }

    /// Returns true if `node_id` is indexed.
    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.positions.contains_key(&node_id)
    }

    /// Captures every snapshot now. Returns the number captured.
    pub fn capture_all(&self) -> usize {
        self.entries.iter().filter_map(IndexEntry::snapshot).count()
    }

    fn push(&mut self, node_id: NodeId, node: &Arc<dyn SceneNode>) {
        self.positions.insert(node_id, self.entries.len());
        self.entries.push(IndexEntry {
            node_id,
            node: Arc::downgrade(node),
            snapshot: OnceLock::new(),
        });
    }
}

/// Builds a [`LocalSceneIndex`] from a root node.
pub struct SceneIndexBuilder {
    shared: Arc<SceneSharedState>,
    index: LocalSceneIndex,
}

impl SceneIndexBuilder {
    /// Indexes every node reachable from `root`.
    ///
    /// A missing root, or one that cannot get a shared state, yields an
    /// empty index.
    #[must_use]
    pub fn build_index(root: Option<&Arc<dyn SceneNode>>) -> LocalSceneIndex {
        let Some(root) = root else {
            return LocalSceneIndex::default();
        };
        let Some(shared) = Self::root_shared_state(root.as_ref()) else {
            tracing::warn!("index: root node has no shared state, scene skipped");
            return LocalSceneIndex::default();
        };

        let mut builder = Self {
            index: LocalSceneIndex {
                scene_id: shared.scene_id(),
                ..LocalSceneIndex::default()
            },
            shared,
        };
        builder.visit_from(root);
        builder.index
    }

    fn root_shared_state(root: &dyn SceneNode) -> Option<Arc<SceneSharedState>> {
        if let Some(shared) = root.shared_state() {
            return Some(shared);
        }
        let shared = root.make_shared_state()?;
        root.set_shared_state(Arc::clone(&shared)).then_some(shared)
    }

    /// Registers `node` with this scene. Returns its id, or `None` if the
    /// node belongs to another scene.
    fn register(&self, node: &dyn SceneNode) -> Option<NodeId> {
        match node.shared_state() {
            Some(current) if !Arc::ptr_eq(&current, &self.shared) => {
                tracing::warn!(node_id = node.node_id(), "index: node belongs to another scene");
                return None;
            }
            Some(_) => {}
            None => {
                if !node.set_shared_state(Arc::clone(&self.shared)) {
                    return None;
                }
            }
        }
        let mut node_id = node.node_id();
        if node_id == INVALID_NODE_ID {
            node_id = self.shared.make_id();
            node.set_node_id(node_id);
        }
        Some(node_id)
    }

    fn visit_from(&mut self, root: &Arc<dyn SceneNode>) {
        let mut stack: Vec<(Arc<dyn SceneNode>, NodeId)> = vec![(Arc::clone(root), INVALID_NODE_ID)];

        while let Some((node, referencer)) = stack.pop() {
            let Some(node_id) = self.register(node.as_ref()) else {
                continue;
            };
            if self.index.contains(node_id) {
                continue;
            }
            // Indexed before its children are pushed: cycles terminate here.
            self.index.push(node_id, &node);
            node.register_referencer(referencer);

            let mut children = Vec::new();
            for i in 0..node.reference_proxy_count() {
                let Some(proxy) = node.reference_proxy(i) else {
                    continue;
                };
                children.extend((0..proxy.num()).filter_map(|j| proxy.node(j).cloned()));
            }
            // Reverse so the first reference is visited first.
            stack.extend(children.into_iter().rev().map(|child| (child, node_id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MemoryNode, MemoryScene};

    fn as_root(node: &Arc<MemoryNode>) -> Arc<dyn SceneNode> {
        Arc::clone(node) as Arc<dyn SceneNode>
    }

    #[test]
    fn test_null_root_yields_empty_index() {
        let index = SceneIndexBuilder::build_index(None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_detached_root_gets_shared_state_and_ids() {
        let root = MemoryNode::new("root");
        let child = MemoryNode::new("child");
        root.add_reference("children", &child);

        let index = SceneIndexBuilder::build_index(Some(&as_root(&root)));
        assert_eq!(index.len(), 2);
        assert!(root.shared_state().is_some());
        assert_eq!(root.id(), 1);
        assert_eq!(child.id(), 2);
        assert_eq!(index.scene_id().display_name, "root");
        assert_eq!(child.referencers(), vec![1]);
    }

    #[test]
    fn test_cycles_and_shared_children_are_indexed_once() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let a = scene.create_node("a");
        let b = scene.create_node("b");
        root.add_reference("children", &a);
        root.add_reference("children", &b);
        a.add_reference("sibling", &b);
        b.add_reference("back", &root);

        let index = SceneIndexBuilder::build_index(Some(&as_root(&root)));
        assert_eq!(index.len(), 3);
        let order: Vec<_> = index.entries().map(IndexEntry::node_id).collect();
        assert_eq!(order, vec![root.id(), a.id(), b.id()]);
        // b was first reached through a.
        assert_eq!(b.referencers(), vec![a.id()]);
    }

    #[test]
    fn test_unreachable_nodes_are_not_indexed() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let _orphan = scene.create_node("orphan");

        let index = SceneIndexBuilder::build_index(Some(&as_root(&root)));
        assert_eq!(index.len(), 1);
        assert!(index.contains(root.id()));
    }

    #[test]
    fn test_hashes_are_lazy() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let index = SceneIndexBuilder::build_index(Some(&as_root(&root)));

        let entry = index.get(root.id()).unwrap();
        assert_eq!(entry.cached_hash(), UNKNOWN_HASH);
        assert_eq!(index.capture_all(), 1);
        assert_ne!(entry.cached_hash(), UNKNOWN_HASH);
    }

    #[test]
    fn test_captured_snapshot_ignores_later_mutation() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let index = SceneIndexBuilder::build_index(Some(&as_root(&root)));
        index.capture_all();
        let before = index.get(root.id()).unwrap().cached_hash();

        root.set_parameter("visible", false);
        assert_eq!(index.get(root.id()).unwrap().cached_hash(), before);
    }
}
