//! # Stream Pipes
//!
//! Carries one delta conversation across the network.
//!
//! ```text
//!  source endpoint                               destination endpoint
//!  ┌──────────────────────────┐                 ┌───────────────────────────┐
//!  │ do_diff ─► ScenePipeTo   │ ── Delta ─────► │ ScenePipeFrom ─► consumer │
//!  │            Network       │                 │ Network                   │
//!  │ RemoteScene ◄─ HaveList  │ ◄── HaveList ── │ HaveListToNetwork         │
//!  │               FromNetwork│                 │                           │
//!  └──────────────────────────┘                 └───────────────────────────┘
//! ```
//!
//! Every delta is one batch; batch numbers run `1, 2, 3, …` per direction
//! and skip `0`, which marks out-of-band traffic. The sender opens the
//! next batch only after the destination acknowledged the previous one
//! with a have-list cycle, so a receiver never sees two batches in flight.

mod receiver;
mod reorder;
mod sender;

pub use receiver::{BatchOutcome, HaveListToNetwork, ScenePipeFromNetwork, StreamReceiver};
pub use reorder::{BatchReorderer, DropReason, ReorderStats};
pub use sender::{HaveListFromNetwork, ScenePipeToNetwork, StreamSender};

use std::sync::Arc;

use crate::protocol::Message;
use crate::transport::{send_message, MessageBus};
use crate::types::{EndpointAddress, StreamPort};

/// An item that may end its batch.
pub trait BatchItem {
    /// Returns true if this item is the last of its batch.
    fn closes_batch(&self) -> bool;
}

/// Cycle following `cycle`, skipping the reserved value `0`.
#[inline]
#[must_use]
pub const fn next_cycle(cycle: u32) -> u32 {
    match cycle.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Where one stream end sends its messages.
#[derive(Clone)]
pub struct OutboundLink {
    bus: Arc<dyn MessageBus>,
    peer: EndpointAddress,
    remote_port: StreamPort,
}

impl OutboundLink {
    /// Creates a link to port `remote_port` of endpoint `peer`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, peer: EndpointAddress, remote_port: StreamPort) -> Self {
        Self {
            bus,
            peer,
            remote_port,
        }
    }

    /// Remote endpoint.
    #[must_use]
    pub const fn peer(&self) -> EndpointAddress {
        self.peer
    }

    /// Port of the remote stream end.
    #[must_use]
    pub const fn remote_port(&self) -> StreamPort {
        self.remote_port
    }

    /// Sends one message. Failures are logged.
    pub fn send(&self, message: &Message) -> bool {
        send_message(self.bus.as_ref(), self.peer, message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::index::SceneIndexBuilder;
    use crate::scene::{MemoryScene, MemorySceneProvider, SceneNode};
    use crate::transport::{LocalBus, LocalHub};

    const SOURCE_PORT: StreamPort = 11;
    const DESTINATION_PORT: StreamPort = 22;

    fn pump(bus: &LocalBus, sender: &mut StreamSender, receiver: &mut StreamReceiver) -> usize {
        let mut handled = 0;
        while let Some(envelope) = bus.receive(Duration::from_millis(5)) {
            handled += 1;
            match Message::decode(&envelope.bytes).unwrap() {
                Message::Delta { header, event } => {
                    assert_eq!(header.stream_port, DESTINATION_PORT);
                    assert!(receiver.on_delta(header, event));
                }
                Message::HaveList { header, event } => {
                    assert_eq!(header.stream_port, SOURCE_PORT);
                    sender.on_have_list(header, event);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        handled
    }

    #[test]
    fn test_sender_and_receiver_converge() {
        let hub = LocalHub::new();
        // One bus stands in for both endpoints: every message loops back.
        let bus = Arc::new(hub.connect());
        let address = bus.address();
        let shared: Arc<dyn MessageBus> = Arc::clone(&bus) as Arc<dyn MessageBus>;

        let provider = Arc::new(MemorySceneProvider::new());
        let mut sender = StreamSender::new(OutboundLink::new(Arc::clone(&shared), address, DESTINATION_PORT));
        let mut receiver = StreamReceiver::new(
            OutboundLink::new(shared, address, SOURCE_PORT),
            Arc::clone(&provider) as Arc<dyn crate::scene::SceneProvider>,
            2,
        );

        let mut scene = MemoryScene::new("level");
        let root = scene.create_node("root");
        for name in ["a", "b", "c"] {
            let child = scene.create_node(name);
            root.add_reference("children", &child);
        }
        let root_dyn: Arc<dyn SceneNode> = Arc::clone(&root) as Arc<dyn SceneNode>;
        let index = SceneIndexBuilder::build_index(Some(&root_dyn));

        // SetupScene, then the initial (empty) have-list.
        assert!(sender.sync(Some(&index), 1).is_none());
        pump(&bus, &mut sender, &mut receiver);
        assert!(sender.is_idle());

        let stats = sender.sync(Some(&index), 1).unwrap();
        assert_eq!(stats.sent, 4);
        pump(&bus, &mut sender, &mut receiver);
        assert!(sender.is_idle());
        assert_eq!(sender.remote().have_count(), 4);

        let reconstructed = provider.scene(index.scene_id().guid).unwrap();
        assert_eq!(reconstructed.lock().len(), 4);

        // Same revision: nothing to do.
        assert!(sender.sync(Some(&index), 1).is_none());

        root.set_parameter("visible", false);
        let index = SceneIndexBuilder::build_index(Some(&root_dyn));
        let stats = sender.sync(Some(&index), 2).unwrap();
        assert_eq!((stats.sent, stats.skipped), (1, 3));
        pump(&bus, &mut sender, &mut receiver);
        assert!(sender.is_idle());
    }

    #[test]
    fn test_next_cycle_skips_zero() {
        assert_eq!(next_cycle(0), 1);
        assert_eq!(next_cycle(41), 42);
        assert_eq!(next_cycle(u32::MAX), 1);
    }
}
