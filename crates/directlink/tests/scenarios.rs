//! Integration tests for the index → diff → reconstruct pipeline.

use std::sync::Arc;

use directlink::delta::{CloseDeltaArgs, OpenDeltaArgs, SetupSceneArgs};
use directlink::{
    do_diff, DeltaConsumer, DeltaProducer, ElementSnapshot, LocalSceneIndex, MemoryNode, MemoryScene,
    NodeId, RemoteScene, SceneIndexBuilder, SceneNode, SceneReconstructor,
};
use parking_lot::Mutex;

/// Records every consumer call.
#[derive(Default)]
struct Recorder {
    opens: Vec<OpenDeltaArgs>,
    elements: Vec<Arc<ElementSnapshot>>,
    removed: Vec<NodeId>,
    closes: usize,
}

impl DeltaConsumer for Recorder {
    fn open_delta(&mut self, args: &OpenDeltaArgs) {
        self.opens.push(args.clone());
    }

    fn set_element(&mut self, snapshot: Arc<ElementSnapshot>) {
        self.elements.push(snapshot);
    }

    fn remove_elements(&mut self, node_ids: &[NodeId]) {
        self.removed.extend_from_slice(node_ids);
    }

    fn close_delta(&mut self, _args: &CloseDeltaArgs) {
        self.closes += 1;
    }
}

/// Root referencing two children.
fn three_node_scene() -> (MemoryScene, Arc<MemoryNode>) {
    let mut scene = MemoryScene::new("scenario");
    let root = scene.create_node("root");
    let left = scene.create_node("left");
    let right = scene.create_node("right");
    left.set_parameter("position", [1.0f32, 0.0, 0.0]);
    right.set_parameter("position", [0.0f32, 1.0, 0.0]);
    root.set_references("children", &[left, right]);
    (scene, root)
}

fn index_of(root: &Arc<MemoryNode>) -> LocalSceneIndex {
    let root: Arc<dyn SceneNode> = root.clone();
    let index = SceneIndexBuilder::build_index(Some(&root));
    index.capture_all();
    index
}

fn hashes(index: &LocalSceneIndex) -> Vec<(NodeId, u32)> {
    let mut hashes: Vec<_> = index.entries().map(|e| (e.node_id(), e.cached_hash())).collect();
    hashes.sort_unstable();
    hashes
}

/// Acknowledges everything `recorder` received.
fn acknowledge(remote: &mut RemoteScene, index: &LocalSceneIndex, recorder: &Recorder) {
    remote.have_scene(index.scene_id(), true);
    for element in &recorder.elements {
        remote.have_element(element.node_id(), element.hash());
    }
    remote.close_have_list();
}

#[test]
fn test_scenario_a_index_is_stable() {
    let (_scene, root) = three_node_scene();

    let first = index_of(&root);
    let second = index_of(&root);

    assert_eq!(first.len(), 3);
    assert_eq!(hashes(&first), hashes(&second));
    assert!(hashes(&first).iter().all(|(_, hash)| *hash != 0));
}

#[test]
fn test_scenario_b_first_diff_sends_everything() {
    let (_scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();
    let mut recorder = Recorder::default();

    let stats = do_diff(&index, &mut remote, &mut recorder);

    assert_eq!(stats.sent, 3);
    assert_eq!(recorder.elements.len(), 3);
    assert_eq!(recorder.opens.len(), 1);
    assert!(recorder.opens[0].based_on_new_scene);
    assert_eq!(recorder.closes, 1);
}

#[test]
fn test_scenario_c_acknowledged_scene_sends_nothing() {
    let (_scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();

    let mut first = Recorder::default();
    do_diff(&index, &mut remote, &mut first);
    acknowledge(&mut remote, &index, &first);

    let mut second = Recorder::default();
    let stats = do_diff(&index, &mut remote, &mut second);

    assert!(second.elements.is_empty());
    assert_eq!(stats.skipped, 3);
    assert_eq!(second.opens.len(), 1);
    assert!(!second.opens[0].based_on_new_scene);
    assert_eq!(second.closes, 1);
}

#[test]
fn test_scenario_d_single_edit_sends_one_element() {
    let (scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();
    let mut first = Recorder::default();
    do_diff(&index, &mut remote, &mut first);
    acknowledge(&mut remote, &index, &first);

    let left = scene.find_by_name("left").expect("left node");
    left.set_parameter("position", [5.0f32, 0.0, 0.0]);
    let index = index_of(&root);

    let mut second = Recorder::default();
    do_diff(&index, &mut remote, &mut second);

    assert_eq!(second.elements.len(), 1);
    assert_eq!(second.elements[0].node_id(), left.id());
}

#[test]
fn test_scenario_e_new_scene_guid_resends_everything() {
    let (scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();
    let mut first = Recorder::default();
    do_diff(&index, &mut remote, &mut first);
    acknowledge(&mut remote, &index, &first);

    scene.shared_state().regenerate_guid();
    let index = index_of(&root);
    assert_ne!(index.scene_id().guid, first.opens[0].scene_id.guid);

    let mut second = Recorder::default();
    do_diff(&index, &mut remote, &mut second);

    assert_eq!(second.elements.len(), 3);
    assert!(second.opens[0].based_on_new_scene);
}

#[test]
fn test_removed_node_is_announced() {
    let (scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();
    let mut first = Recorder::default();
    do_diff(&index, &mut remote, &mut first);
    acknowledge(&mut remote, &index, &first);

    let right = scene.find_by_name("right").expect("right node").id();
    let left = scene.find_by_name("left").cloned().expect("left node");
    root.set_references("children", &[left]);
    let index = index_of(&root);

    let mut second = Recorder::default();
    let stats = do_diff(&index, &mut remote, &mut second);

    assert_eq!(second.removed, vec![right]);
    assert_eq!(stats.removed, 1);
    // The root changed: its reference group lost one id
    assert_eq!(second.elements.len(), 1);
    assert_eq!(second.elements[0].node_id(), root.id());
}

#[test]
fn test_reconstructed_scene_matches_source() {
    let (scene, root) = three_node_scene();
    let index = index_of(&root);
    let mut remote = RemoteScene::new();

    let target = Arc::new(Mutex::new(MemoryScene::with_identifier(scene.scene_id())));
    let mut reconstructor = SceneReconstructor::new(Arc::clone(&target));
    reconstructor.setup_scene(&SetupSceneArgs {
        scene_id: scene.scene_id(),
        expect_have_list: false,
    });
    do_diff(&index, &mut remote, &mut reconstructor);

    let rebuilt = target.lock();
    assert_eq!(rebuilt.len(), 3);
    let rebuilt_root = rebuilt.node(root.id()).expect("root rebuilt");
    assert_eq!(rebuilt_root.name().as_deref(), Some("root"));
    assert_eq!(rebuilt_root.reference_ids(), root.reference_ids());
    let left = rebuilt.find_by_name("left").expect("left rebuilt");
    assert_eq!(
        left.parameter("position"),
        scene.find_by_name("left").and_then(|n| n.parameter("position"))
    );
    drop(rebuilt);

    let mut held = reconstructor.have_list();
    held.sort_unstable();
    assert_eq!(held, hashes(&index));
}
