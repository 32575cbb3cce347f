//! # Scene Reconstructor
//!
//! Applies deltas to a [`MemoryScene`].
//!
//! References are linked in a second pass on `close_delta`: forward
//! references to nodes later in the same delta are common, so every
//! node of the batch must exist before links are resolved.
//!
//! Applied snapshot hashes are stored in the scene itself. A reconstructor
//! created for a later stream reports them as its have-list, so the sender
//! resumes from what the scene really holds.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{CloseDeltaArgs, DeltaConsumer, OpenDeltaArgs, SetupSceneArgs};
use crate::scene::MemoryScene;
use crate::snapshot::{ElementSnapshot, ReferenceSnapshot};
use crate::types::{ElementHash, NodeId, SceneIdentifier};

/// In-process [`DeltaConsumer`] rebuilding a scene graph.
pub struct SceneReconstructor {
    scene: Arc<Mutex<MemoryScene>>,
    pending_links: Vec<(NodeId, ReferenceSnapshot)>,
    in_delta: bool,
}

impl SceneReconstructor {
    /// Creates a reconstructor writing into `scene`.
    #[must_use]
    pub fn new(scene: Arc<Mutex<MemoryScene>>) -> Self {
        Self {
            scene,
            pending_links: Vec::new(),
            in_delta: false,
        }
    }

    /// The scene being rebuilt.
    #[must_use]
    pub fn scene(&self) -> &Arc<Mutex<MemoryScene>> {
        &self.scene
    }

    fn adopt(&mut self, scene_id: &SceneIdentifier, force_reset: bool) {
        let mut scene = self.scene.lock();
        if force_reset || scene.scene_id().guid != scene_id.guid {
            tracing::debug!(scene = %scene_id.guid, "reconstructor: resetting scene");
            scene.reset(scene_id.clone());
        }
    }

    fn link_pending(&mut self) {
        let scene = self.scene.lock();
        for (node_id, references) in self.pending_links.drain(..) {
            let Some(node) = scene.node(node_id) else {
                continue;
            };
            node.clear_references();
            for group in &references.groups {
                let targets: Vec<_> = group
                    .referenced_ids
                    .iter()
                    .filter_map(|id| {
                        let target = scene.node(*id).cloned();
                        if target.is_none() {
                            tracing::warn!(node_id, missing = *id, "reconstructor: dangling reference");
                        }
                        target
                    })
                    .collect();
                node.set_references(&group.name, &targets);
            }
        }
    }
}

impl DeltaConsumer for SceneReconstructor {
    fn setup_scene(&mut self, args: &SetupSceneArgs) {
        self.adopt(&args.scene_id, false);
    }

    fn open_delta(&mut self, args: &OpenDeltaArgs) {
        if self.in_delta {
            tracing::warn!("reconstructor: delta opened twice, previous one discarded");
            self.pending_links.clear();
        }
        // A delta not based on previous content replaces the whole scene.
        self.adopt(&args.scene_id, args.based_on_new_scene);
        self.in_delta = true;
    }

    fn set_element(&mut self, snapshot: Arc<ElementSnapshot>) {
        let parameters = match snapshot.parameters() {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::warn!(node_id = snapshot.node_id(), error = %e, "reconstructor: bad parameter blob");
                return;
            }
        };
        let mut scene = self.scene.lock();
        let node = scene.get_or_insert(snapshot.node_id());
        node.replace_store(parameters);
        scene.record_hash(snapshot.node_id(), snapshot.hash());
        drop(scene);
        self.pending_links
            .push((snapshot.node_id(), snapshot.references().clone()));
    }

    fn remove_elements(&mut self, node_ids: &[NodeId]) {
        let mut scene = self.scene.lock();
        for id in node_ids {
            scene.remove_node(*id);
        }
    }

    fn close_delta(&mut self, args: &CloseDeltaArgs) {
        if args.cancelled {
            self.pending_links.clear();
        } else {
            self.link_pending();
        }
        self.in_delta = false;
    }

    fn have_list(&self) -> Vec<(NodeId, ElementHash)> {
        self.scene.lock().held_elements()
    }
}
