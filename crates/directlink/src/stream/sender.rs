//! # Stream Sender
//!
//! Source side of a stream: serializes deltas, applies have-list acks and
//! decides when the next diff may run.

use std::sync::Arc;

use super::{next_cycle, BatchReorderer, OutboundLink};
use crate::delta::{
    CloseDeltaArgs, DeltaConsumer, DeltaProducer, OpenDeltaArgs, SetupSceneArgs,
};
use crate::diff::{do_diff, DiffStats, RemoteScene};
use crate::index::LocalSceneIndex;
use crate::protocol::{DeltaEvent, FrameHeader, HaveListEvent, Message};
use crate::snapshot::ElementSnapshot;
use crate::types::{Guid, NodeId};

/// [`DeltaConsumer`] turning delta calls into `Delta` messages.
pub struct ScenePipeToNetwork {
    link: OutboundLink,
    batch: u32,
    next_message: u32,
    messages_sent: u64,
}

impl ScenePipeToNetwork {
    /// Creates a pipe sending over `link`.
    #[must_use]
    pub const fn new(link: OutboundLink) -> Self {
        Self {
            link,
            batch: 0,
            next_message: 0,
            messages_sent: 0,
        }
    }

    /// Number of the last opened batch, `0` before the first.
    #[must_use]
    pub const fn last_batch(&self) -> u32 {
        self.batch
    }

    /// Messages handed to the transport.
    #[must_use]
    pub const fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    fn send(&mut self, batch: u32, event: DeltaEvent) {
        let message_code = if batch == 0 {
            0
        } else {
            let code = self.next_message;
            self.next_message += 1;
            code
        };
        let header = FrameHeader::new(self.link.remote_port(), batch, message_code);
        if self.link.send(&Message::Delta { header, event }) {
            self.messages_sent += 1;
        }
    }
}

impl DeltaConsumer for ScenePipeToNetwork {
    fn setup_scene(&mut self, args: &SetupSceneArgs) {
        self.send(0, DeltaEvent::SetupScene(args.clone()));
    }

    fn open_delta(&mut self, args: &OpenDeltaArgs) {
        self.batch = next_cycle(self.batch);
        self.next_message = 0;
        self.send(self.batch, DeltaEvent::OpenDelta(args.clone()));
    }

    fn set_element(&mut self, snapshot: Arc<ElementSnapshot>) {
        self.send(self.batch, DeltaEvent::SetElement(snapshot));
    }

    fn remove_elements(&mut self, node_ids: &[NodeId]) {
        self.send(self.batch, DeltaEvent::RemoveElements(node_ids.to_vec()));
    }

    fn close_delta(&mut self, args: &CloseDeltaArgs) {
        self.send(self.batch, DeltaEvent::CloseDelta(*args));
    }
}

/// Reorders incoming have-list cycles and applies them to a producer.
#[derive(Default)]
pub struct HaveListFromNetwork {
    reorderer: BatchReorderer<HaveListEvent>,
    acked_batch: u32,
}

impl HaveListFromNetwork {
    /// Creates an empty pipe expecting cycle 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one message. Returns the acknowledged delta batch each time
    /// a cycle completes (`0` for an unsolicited list).
    pub fn on_message(
        &mut self,
        header: FrameHeader,
        event: HaveListEvent,
        producer: &mut dyn DeltaProducer,
    ) -> Option<u32> {
        let ready = self
            .reorderer
            .push(header.batch_code, header.message_code, event)
            .ok()?;
        let mut completed = None;
        for event in ready {
            match event {
                HaveListEvent::Open {
                    scene_id,
                    keep_previous_content,
                    acked_batch,
                } => {
                    self.acked_batch = acked_batch;
                    producer.have_scene(&scene_id, keep_previous_content);
                }
                HaveListEvent::Elements { node_ids, hashes } => {
                    for (node_id, hash) in node_ids.into_iter().zip(hashes) {
                        producer.have_element(node_id, hash);
                    }
                }
                HaveListEvent::Close => {
                    producer.close_have_list();
                    completed = Some(self.acked_batch);
                }
            }
        }
        completed
    }
}

/// Source end of one stream.
pub struct StreamSender {
    pipe: ScenePipeToNetwork,
    have_list: HaveListFromNetwork,
    remote: RemoteScene,
    announced: Option<Guid>,
    awaiting_have_list: bool,
    awaiting_ack: Option<u32>,
    synced_revision: u64,
    totals: DiffStats,
}

impl StreamSender {
    /// Creates a sender talking to the receiver behind `link`.
    #[must_use]
    pub fn new(link: OutboundLink) -> Self {
        Self {
            pipe: ScenePipeToNetwork::new(link),
            have_list: HaveListFromNetwork::new(),
            remote: RemoteScene::new(),
            announced: None,
            awaiting_have_list: false,
            awaiting_ack: None,
            synced_revision: 0,
            totals: DiffStats::default(),
        }
    }

    /// Counters summed over every diff this sender ran.
    #[must_use]
    pub const fn totals(&self) -> DiffStats {
        self.totals
    }

    /// What the destination is known to hold.
    #[must_use]
    pub const fn remote(&self) -> &RemoteScene {
        &self.remote
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        !self.awaiting_have_list && self.awaiting_ack.is_none()
    }

    /// Handles one have-list message from the receiver.
    pub fn on_have_list(&mut self, header: FrameHeader, event: HaveListEvent) {
        let Some(acked) = self.have_list.on_message(header, event, &mut self.remote) else {
            return;
        };
        if acked == 0 {
            self.awaiting_have_list = false;
        } else if self.awaiting_ack == Some(acked) {
            self.awaiting_ack = None;
        } else {
            tracing::debug!(acked, expected = ?self.awaiting_ack, "sender: unexpected ack");
        }
    }

    /// Brings the receiver up to date with `index` taken at `revision`.
    ///
    /// Announces the scene first when its identity is new. Returns the diff
    /// counters when a delta was sent.
    pub fn sync(&mut self, index: Option<&LocalSceneIndex>, revision: u64) -> Option<DiffStats> {
        if !self.is_idle() {
            return None;
        }
        let index = index?;
        let guid = index.scene_id().guid;
        if self.announced != Some(guid) {
            self.pipe.setup_scene(&SetupSceneArgs {
                scene_id: index.scene_id().clone(),
                expect_have_list: true,
            });
            self.announced = Some(guid);
            self.awaiting_have_list = true;
            self.synced_revision = 0;
            return None;
        }
        if revision == self.synced_revision {
            return None;
        }

        let stats = do_diff(index, &mut self.remote, &mut self.pipe);
        self.awaiting_ack = Some(self.pipe.last_batch());
        self.synced_revision = revision;
        self.totals += stats;
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementHash, SceneIdentifier};

    #[derive(Default)]
    struct Acks {
        scenes: Vec<bool>,
        elements: Vec<(NodeId, ElementHash)>,
        closed: usize,
    }

    impl DeltaProducer for Acks {
        fn have_scene(&mut self, _scene_id: &SceneIdentifier, keep_previous_content: bool) {
            self.scenes.push(keep_previous_content);
        }

        fn have_element(&mut self, node_id: NodeId, hash: ElementHash) {
            self.elements.push((node_id, hash));
        }

        fn close_have_list(&mut self) {
            self.closed += 1;
        }
    }

    #[test]
    fn test_have_list_cycle_applied_in_order() {
        let scene_id = SceneIdentifier::new("level");
        let mut pipe = HaveListFromNetwork::new();
        let mut acks = Acks::default();

        let messages = [
            (2, HaveListEvent::Close),
            (
                1,
                HaveListEvent::Elements {
                    node_ids: vec![1, 2],
                    hashes: vec![10, 20],
                },
            ),
            (
                0,
                HaveListEvent::Open {
                    scene_id,
                    keep_previous_content: true,
                    acked_batch: 3,
                },
            ),
        ];

        let mut completed = Vec::new();
        for (code, event) in messages {
            completed.extend(pipe.on_message(FrameHeader::new(1, 1, code), event, &mut acks));
        }
        assert_eq!(completed, vec![3]);
        assert_eq!(acks.scenes, vec![true]);
        assert_eq!(acks.elements, vec![(1, 10), (2, 20)]);
        assert_eq!(acks.closed, 1);
    }

    #[test]
    fn test_stale_have_list_cycle_ignored() {
        let mut pipe = HaveListFromNetwork::new();
        let mut acks = Acks::default();
        let done = pipe.on_message(FrameHeader::new(1, 4, 0), HaveListEvent::Close, &mut acks);
        assert!(done.is_none());
        assert_eq!(acks.closed, 0);
    }
}
