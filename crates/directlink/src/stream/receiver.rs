//! # Stream Receiver
//!
//! Destination side of a stream: restores delta order, feeds the scene
//! provider's consumer and acknowledges every batch with a have-list.

use std::sync::Arc;

use super::{next_cycle, BatchReorderer, OutboundLink};
use crate::delta::{DeltaConsumer, DeltaProducer};
use crate::protocol::{DeltaEvent, FrameHeader, HaveListEvent, Message};
use crate::scene::SceneProvider;
use crate::types::{ElementHash, NodeId, SceneIdentifier};

/// One delivered batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Batch number.
    pub batch: u32,
    /// Elements delivered to the consumer, with their hashes.
    pub delivered: Vec<(NodeId, ElementHash)>,
    /// The sender cancelled the batch.
    pub cancelled: bool,
}

/// Restores delta order and drives a [`DeltaConsumer`].
pub struct ScenePipeFromNetwork {
    consumer: Option<Box<dyn DeltaConsumer>>,
    reorderer: BatchReorderer<DeltaEvent>,
    delivered: Vec<(NodeId, ElementHash)>,
}

impl Default for ScenePipeFromNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenePipeFromNetwork {
    /// Creates a pipe with no consumer yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumer: None,
            reorderer: BatchReorderer::new(),
            delivered: Vec::new(),
        }
    }

    /// Creates a pipe feeding `consumer`.
    #[must_use]
    pub fn with_consumer(consumer: Box<dyn DeltaConsumer>) -> Self {
        let mut pipe = Self::new();
        pipe.consumer = Some(consumer);
        pipe
    }

    /// Replaces the consumer.
    pub fn set_consumer(&mut self, consumer: Box<dyn DeltaConsumer>) {
        self.consumer = Some(consumer);
    }

    /// Current consumer.
    #[must_use]
    pub fn consumer(&self) -> Option<&dyn DeltaConsumer> {
        self.consumer.as_deref()
    }

    /// Ordering state.
    #[must_use]
    pub const fn reorderer(&self) -> &BatchReorderer<DeltaEvent> {
        &self.reorderer
    }

    /// Handles one message. Returns the batch it completed, if any.
    pub fn on_delta(&mut self, header: FrameHeader, event: DeltaEvent) -> Option<BatchOutcome> {
        let batch = self.reorderer.expected_batch();
        let ready = self
            .reorderer
            .push(header.batch_code, header.message_code, event)
            .ok()?;
        let mut outcome = None;
        for event in ready {
            if let Some(done) = self.dispatch(batch, event) {
                outcome = Some(done);
            }
        }
        outcome
    }

    fn dispatch(&mut self, batch: u32, event: DeltaEvent) -> Option<BatchOutcome> {
        let Some(consumer) = self.consumer.as_deref_mut() else {
            tracing::warn!(batch, "receiver: no consumer, delta message dropped");
            return None;
        };
        match event {
            DeltaEvent::SetupScene(args) => consumer.setup_scene(&args),
            DeltaEvent::OpenDelta(args) => {
                self.delivered.clear();
                consumer.open_delta(&args);
            }
            DeltaEvent::SetElement(snapshot) => {
                self.delivered.push((snapshot.node_id(), snapshot.hash()));
                consumer.set_element(snapshot);
            }
            DeltaEvent::RemoveElements(node_ids) => consumer.remove_elements(&node_ids),
            DeltaEvent::CloseDelta(args) => {
                consumer.close_delta(&args);
                let delivered = std::mem::take(&mut self.delivered);
                return Some(BatchOutcome {
                    batch,
                    delivered: if args.cancelled { Vec::new() } else { delivered },
                    cancelled: args.cancelled,
                });
            }
        }
        None
    }
}

/// [`DeltaProducer`] turning have-list calls into `HaveList` messages.
pub struct HaveListToNetwork {
    link: OutboundLink,
    batch_size: usize,
    cycle: u32,
    next_message: u32,
    acked_batch: u32,
    node_ids: Vec<NodeId>,
    hashes: Vec<ElementHash>,
}

impl HaveListToNetwork {
    /// Creates a producer packing up to `batch_size` elements per message.
    #[must_use]
    pub fn new(link: OutboundLink, batch_size: usize) -> Self {
        Self {
            link,
            batch_size: batch_size.max(1),
            cycle: 0,
            next_message: 0,
            acked_batch: 0,
            node_ids: Vec::new(),
            hashes: Vec::new(),
        }
    }

    /// Delta batch the next cycle acknowledges.
    pub fn set_acked_batch(&mut self, batch: u32) {
        self.acked_batch = batch;
    }

    /// Number of the last opened cycle.
    #[must_use]
    pub const fn cycle(&self) -> u32 {
        self.cycle
    }

    fn send(&mut self, event: HaveListEvent) {
        let header = FrameHeader::new(self.link.remote_port(), self.cycle, self.next_message);
        self.next_message += 1;
        self.link.send(&Message::HaveList { header, event });
    }

    fn flush(&mut self) {
        if self.node_ids.is_empty() {
            return;
        }
        let node_ids = std::mem::take(&mut self.node_ids);
        let hashes = std::mem::take(&mut self.hashes);
        self.send(HaveListEvent::Elements { node_ids, hashes });
    }
}

impl DeltaProducer for HaveListToNetwork {
    fn have_scene(&mut self, scene_id: &SceneIdentifier, keep_previous_content: bool) {
        self.cycle = next_cycle(self.cycle);
        self.next_message = 0;
        self.node_ids.clear();
        self.hashes.clear();
        self.send(HaveListEvent::Open {
            scene_id: scene_id.clone(),
            keep_previous_content,
            acked_batch: self.acked_batch,
        });
    }

    fn have_element(&mut self, node_id: NodeId, hash: ElementHash) {
        self.node_ids.push(node_id);
        self.hashes.push(hash);
        if self.node_ids.len() >= self.batch_size {
            self.flush();
        }
    }

    fn close_have_list(&mut self) {
        self.flush();
        self.send(HaveListEvent::Close);
    }
}

/// Destination end of one stream.
pub struct StreamReceiver {
    provider: Arc<dyn SceneProvider>,
    pipe: ScenePipeFromNetwork,
    have_list: HaveListToNetwork,
    scene_id: Option<SceneIdentifier>,
}

impl StreamReceiver {
    /// Creates a receiver applying deltas through `provider`.
    #[must_use]
    pub fn new(link: OutboundLink, provider: Arc<dyn SceneProvider>, have_list_batch_size: usize) -> Self {
        Self {
            provider,
            pipe: ScenePipeFromNetwork::new(),
            have_list: HaveListToNetwork::new(link, have_list_batch_size),
            scene_id: None,
        }
    }

    /// Scene currently received.
    #[must_use]
    pub const fn scene_id(&self) -> Option<&SceneIdentifier> {
        self.scene_id.as_ref()
    }

    /// Handles one delta message. Returns false if the stream can no
    /// longer be served and should be closed.
    pub fn on_delta(&mut self, header: FrameHeader, event: DeltaEvent) -> bool {
        let setup = match &event {
            DeltaEvent::SetupScene(args) => Some(args.clone()),
            _ => None,
        };
        if let Some(args) = &setup {
            if !self.attach(&args.scene_id) {
                return false;
            }
        }
        if let Some(outcome) = self.pipe.on_delta(header, event) {
            self.acknowledge(&outcome);
        }
        if let Some(args) = setup {
            if args.expect_have_list {
                self.announce(&args.scene_id);
            }
        }
        true
    }

    fn attach(&mut self, scene_id: &SceneIdentifier) -> bool {
        let same_scene = self.scene_id.as_ref().is_some_and(|s| s.guid == scene_id.guid);
        if !same_scene || self.pipe.consumer().is_none() {
            let Some(consumer) = self.provider.get_delta_consumer(scene_id) else {
                tracing::warn!(scene = %scene_id.guid, "receiver: provider refused scene");
                return false;
            };
            self.pipe.set_consumer(consumer);
        }
        self.scene_id = Some(scene_id.clone());
        true
    }

    /// Sends what the consumer already holds, replacing the sender's view.
    fn announce(&mut self, scene_id: &SceneIdentifier) {
        let held = self.pipe.consumer().map(|c| c.have_list()).unwrap_or_default();
        tracing::debug!(scene = %scene_id.guid, held = held.len(), "receiver: announcing have-list");
        self.have_list.set_acked_batch(0);
        self.have_list.have_scene(scene_id, false);
        for (node_id, hash) in held {
            self.have_list.have_element(node_id, hash);
        }
        self.have_list.close_have_list();
    }

    fn acknowledge(&mut self, outcome: &BatchOutcome) {
        let Some(scene_id) = self.scene_id.clone() else {
            return;
        };
        self.have_list.set_acked_batch(outcome.batch);
        self.have_list.have_scene(&scene_id, true);
        for (node_id, hash) in &outcome.delivered {
            self.have_list.have_element(*node_id, *hash);
        }
        self.have_list.close_have_list();
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::delta::{CloseDeltaArgs, OpenDeltaArgs};
    use crate::scene::ParameterStore;
    use crate::snapshot::{ElementSnapshot, ReferenceSnapshot};
    use parking_lot::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Open,
        Set(NodeId),
        Close,
    }

    struct Log(Arc<Mutex<Vec<Call>>>);

    impl DeltaConsumer for Log {
        fn open_delta(&mut self, _args: &OpenDeltaArgs) {
            self.0.lock().push(Call::Open);
        }

        fn set_element(&mut self, snapshot: Arc<ElementSnapshot>) {
            self.0.lock().push(Call::Set(snapshot.node_id()));
        }

        fn close_delta(&mut self, _args: &CloseDeltaArgs) {
            self.0.lock().push(Call::Close);
        }
    }

    fn batch(batch: u32, elements: u32) -> Vec<(FrameHeader, DeltaEvent)> {
        let scene_id = SceneIdentifier::new("s");
        let mut events = vec![DeltaEvent::OpenDelta(OpenDeltaArgs {
            scene_id,
            based_on_new_scene: false,
            element_count_hint: elements,
        })];
        for id in 1..=elements {
            let mut store = ParameterStore::new();
            store.set("index", i64::from(id));
            let snapshot = ElementSnapshot::new(id, &store, ReferenceSnapshot::default());
            events.push(DeltaEvent::SetElement(Arc::new(snapshot)));
        }
        events.push(DeltaEvent::CloseDelta(CloseDeltaArgs::default()));
        events
            .into_iter()
            .enumerate()
            .map(|(code, event)| (FrameHeader::new(1, batch, u32::try_from(code).unwrap()), event))
            .collect()
    }

    fn expected_calls(elements: u32) -> Vec<Call> {
        let mut calls = vec![Call::Open];
        calls.extend((1..=elements).map(Call::Set));
        calls.push(Call::Close);
        calls
    }

    #[test]
    fn test_scrambled_delta_delivered_in_order() {
        let mut rng = StdRng::seed_from_u64(1234);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipe = ScenePipeFromNetwork::with_consumer(Box::new(Log(Arc::clone(&log))));

        let mut messages = batch(1, 16);
        messages.shuffle(&mut rng);
        let mut outcomes = Vec::new();
        for (header, event) in messages {
            outcomes.extend(pipe.on_delta(header, event));
        }

        assert_eq!(*log.lock(), expected_calls(16));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].batch, 1);
        assert_eq!(outcomes[0].delivered.len(), 16);
    }

    #[test]
    fn test_foreign_batch_does_not_disturb_current() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipe = ScenePipeFromNetwork::with_consumer(Box::new(Log(Arc::clone(&log))));

        let current = batch(1, 3);
        let future = batch(2, 1);
        let stale = batch(7, 1);
        pipe.on_delta(current[0].0, current[0].1.clone());
        pipe.on_delta(future[1].0, future[1].1.clone());
        pipe.on_delta(current[2].0, current[2].1.clone());
        pipe.on_delta(stale[0].0, stale[0].1.clone());
        for (header, event) in [&current[1], &current[3], &current[4]] {
            pipe.on_delta(*header, event.clone());
        }

        assert_eq!(*log.lock(), expected_calls(3));
        assert_eq!(pipe.reorderer().stats().dropped, 2);
    }

    #[test]
    fn test_messages_without_consumer_are_dropped() {
        let mut pipe = ScenePipeFromNetwork::new();
        let mut outcome = None;
        for (header, event) in batch(1, 2) {
            outcome = pipe.on_delta(header, event).or(outcome);
        }
        assert!(outcome.is_none());
        // Ordering state still advanced past the batch.
        assert_eq!(pipe.reorderer().expected_batch(), 2);
    }
}
