//! # Delta Protocol
//!
//! Push-based interfaces decoupling "what changed" from "how it travels".
//!
//! ```text
//!  diff engine ──► DeltaConsumer ──► (network pipe | SceneReconstructor)
//!  have-list   ◄── DeltaProducer ◄── (network pipe | local ack)
//! ```
//!
//! ## Ordering Contract
//!
//! One delta is exactly one [`DeltaConsumer::open_delta`], any number of
//! [`DeltaConsumer::set_element`] / [`DeltaConsumer::remove_elements`], and
//! exactly one [`DeltaConsumer::close_delta`]. A consumer never sees two
//! deltas interleaved.

mod reconstructor;

pub use reconstructor::SceneReconstructor;

use std::sync::Arc;

use crate::snapshot::ElementSnapshot;
use crate::types::{ElementHash, NodeId, SceneIdentifier};

/// Scene identity announcement, sent before any delta of a new scene.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupSceneArgs {
    /// Scene that upcoming deltas describe.
    pub scene_id: SceneIdentifier,
    /// The sender waits for a have-list before its first delta.
    pub expect_have_list: bool,
}

/// Opens one delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenDeltaArgs {
    /// Target scene.
    pub scene_id: SceneIdentifier,
    /// The delta does not build on previously sent content.
    pub based_on_new_scene: bool,
    /// Expected number of `set_element` calls.
    pub element_count_hint: u32,
}

/// Closes one delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseDeltaArgs {
    /// The delta was aborted and should be discarded.
    pub cancelled: bool,
}

/// Receives deltas.
pub trait DeltaConsumer: Send + Sync {
    /// Announces the scene identity. Out of band, may precede any delta.
    fn setup_scene(&mut self, args: &SetupSceneArgs) {
        let _ = args;
    }

    /// Starts a delta.
    fn open_delta(&mut self, args: &OpenDeltaArgs);

    /// Adds or replaces one element.
    fn set_element(&mut self, snapshot: Arc<ElementSnapshot>);

    /// Removes elements the producer no longer has.
    fn remove_elements(&mut self, node_ids: &[NodeId]) {
        let _ = node_ids;
    }

    /// Ends the current delta.
    fn close_delta(&mut self, args: &CloseDeltaArgs);

    /// Elements this consumer already holds, announced when a stream opens.
    fn have_list(&self) -> Vec<(NodeId, ElementHash)> {
        Vec::new()
    }
}

/// Back channel from a consumer to the producer of its deltas.
pub trait DeltaProducer: Send {
    /// Starts a have-list for `scene_id`. Without `keep_previous_content`
    /// the producer forgets everything it believed the consumer had.
    fn have_scene(&mut self, scene_id: &SceneIdentifier, keep_previous_content: bool);

    /// The consumer holds `node_id` with content `hash`.
    fn have_element(&mut self, node_id: NodeId, hash: ElementHash);

    /// Ends the have-list.
    fn close_have_list(&mut self) {}
}
