//! # Endpoint Shared State
//!
//! Everything the caller thread and the network thread both touch.
//!
//! ## Lock Order
//!
//! Each resource has its own lock. When more than one is needed they are
//! taken in this order, never the reverse:
//!
//! ```text
//! streams → sources → destinations → raw_info → observers
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::tick::TickStats;
use crate::index::LocalSceneIndex;
use crate::protocol::DataPointInfo;
use crate::scene::{SceneNode, SceneProvider};
use crate::stream::{StreamReceiver, StreamSender};
use crate::types::{DataPointId, EndpointAddress, StreamPort, INVALID_STREAM_PORT};

/// Connection state of one stream.
///
/// Moves forward only: `Uninitialized → RequestSent → Active → Closed`.
/// `Closed` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamStatus {
    /// Created locally, request not sent yet.
    #[default]
    Uninitialized = 0,
    /// `OpenStreamRequest` sent, waiting for the answer.
    RequestSent = 1,
    /// Both ends exist; deltas flow.
    Active = 2,
    /// Terminal.
    Closed = 3,
}

impl StreamStatus {
    /// Returns true if `next` is reachable from this state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self != Self::Closed && next > self
    }
}

/// Sender or receiver owned by one stream end.
pub(crate) enum StreamEnd {
    /// Not connected yet, or closed.
    None,
    /// This endpoint owns the source.
    Sender(Box<StreamSender>),
    /// This endpoint owns the destination.
    Receiver(Box<StreamReceiver>),
}

/// One end of a stream.
pub(crate) struct StreamDescription {
    pub source_id: DataPointId,
    pub destination_id: DataPointId,
    pub local_port: StreamPort,
    pub remote_port: StreamPort,
    pub peer: EndpointAddress,
    /// The local endpoint owns the source.
    pub local_is_source: bool,
    status: StreamStatus,
    pub end: StreamEnd,
}

impl StreamDescription {
    pub fn new(
        source_id: DataPointId,
        destination_id: DataPointId,
        local_port: StreamPort,
        peer: EndpointAddress,
        local_is_source: bool,
    ) -> Self {
        Self {
            source_id,
            destination_id,
            local_port,
            remote_port: INVALID_STREAM_PORT,
            peer,
            local_is_source,
            status: StreamStatus::Uninitialized,
            end: StreamEnd::None,
        }
    }

    pub const fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status != StreamStatus::Closed
    }

    pub fn connects(&self, source_id: DataPointId, destination_id: DataPointId) -> bool {
        self.source_id == source_id && self.destination_id == destination_id
    }

    /// Moves to `next`. Backward moves are refused and logged.
    pub fn set_status(&mut self, next: StreamStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                port = self.local_port,
                from = ?self.status,
                to = ?next,
                "endpoint: refused stream transition"
            );
            return false;
        }
        tracing::debug!(port = self.local_port, from = ?self.status, to = ?next, "endpoint: stream transition");
        self.status = next;
        if next == StreamStatus::Closed {
            self.end = StreamEnd::None;
        }
        true
    }
}

/// Stream ends of one endpoint.
///
/// Closed ends are pruned by the network thread. Only the peer of the last
/// closed stream of each pair is kept, so the table stays bounded by the
/// number of pairs ever connected.
#[derive(Default)]
pub(crate) struct StreamTable {
    live: Vec<StreamDescription>,
    closed: HashMap<(DataPointId, DataPointId), EndpointAddress>,
}

impl StreamTable {
    pub fn iter(&self) -> std::slice::Iter<'_, StreamDescription> {
        self.live.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, StreamDescription> {
        self.live.iter_mut()
    }

    pub fn push(&mut self, stream: StreamDescription) {
        self.live.push(stream);
    }

    /// Status of the most recent stream connecting the pair.
    pub fn status(&self, source_id: DataPointId, destination_id: DataPointId) -> Option<StreamStatus> {
        self.live
            .iter()
            .rev()
            .find(|s| s.connects(source_id, destination_id))
            .map(StreamDescription::status)
            .or_else(|| {
                self.closed
                    .contains_key(&(source_id, destination_id))
                    .then_some(StreamStatus::Closed)
            })
    }

    /// Returns true if a stream between the pair towards `peer` was closed.
    pub fn was_closed_towards(
        &self,
        source_id: DataPointId,
        destination_id: DataPointId,
        peer: EndpointAddress,
    ) -> bool {
        self.closed.get(&(source_id, destination_id)) == Some(&peer)
            || self
                .live
                .iter()
                .any(|s| !s.is_open() && s.peer == peer && s.connects(source_id, destination_id))
    }

    /// Drops closed ends, remembering their pair. Returns how many went.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.live.len();
        let closed = &mut self.closed;
        self.live.retain(|s| {
            if s.is_open() {
                return true;
            }
            closed.insert((s.source_id, s.destination_id), s.peer);
            false
        });
        before - self.live.len()
    }

    /// Forgets the closed ends and close history of a removed data point.
    pub fn forget_data_point(&mut self, id: DataPointId) {
        self.live
            .retain(|s| s.is_open() || (s.source_id != id && s.destination_id != id));
        self.closed
            .retain(|(source_id, destination_id), _| *source_id != id && *destination_id != id);
    }
}

/// A local source.
pub(crate) struct SourceEntry {
    pub info: DataPointInfo,
    pub root: Option<Arc<dyn SceneNode>>,
    pub index: Option<Arc<LocalSceneIndex>>,
    pub snapshot_revision: u64,
}

/// A local destination.
pub(crate) struct DestinationEntry {
    pub info: DataPointInfo,
    pub provider: Arc<dyn SceneProvider>,
}

/// One endpoint known to this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint name.
    pub name: String,
    /// Bus address.
    pub address: EndpointAddress,
    /// This process's own endpoint.
    pub is_local: bool,
}

/// One data point known to this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPointRawInfo {
    /// Description published by the owner.
    pub info: DataPointInfo,
    /// Owning endpoint.
    pub owner: EndpointAddress,
    /// Owned by this process.
    pub is_local: bool,
}

/// One stream end of this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Source data point.
    pub source: DataPointId,
    /// Destination data point.
    pub destination: DataPointId,
    /// Local port.
    pub port: StreamPort,
    /// Connection state.
    pub status: StreamStatus,
}

/// Snapshot of everything an endpoint knows, rebuilt by the network thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawInfo {
    /// Local endpoint first, then known peers.
    pub endpoints: Vec<EndpointInfo>,
    /// Local data points first, then remote ones.
    pub data_points: Vec<DataPointRawInfo>,
    /// Local stream ends not pruned yet.
    pub streams: Vec<StreamInfo>,
}

impl RawInfo {
    /// Data point by id.
    #[must_use]
    pub fn data_point(&self, id: DataPointId) -> Option<&DataPointRawInfo> {
        self.data_points.iter().find(|d| d.info.id == id)
    }

    /// Remote data points with a given role and name.
    pub fn remote_data_points<'a>(
        &'a self,
        is_source: bool,
        name: &'a str,
    ) -> impl Iterator<Item = &'a DataPointRawInfo> + 'a {
        self.data_points
            .iter()
            .filter(move |d| !d.is_local && d.info.is_source == is_source && d.info.name == name)
    }
}

/// Notified by the network thread when the [`RawInfo`] changed.
pub trait EndpointObserver: Send + Sync {
    /// Called with the new state, from the network thread.
    fn on_state_changed(&self, info: &RawInfo);
}

/// State shared by an [`Endpoint`](super::Endpoint) and its network thread.
pub(crate) struct SharedState {
    pub name: String,
    pub address: EndpointAddress,
    pub streams: RwLock<StreamTable>,
    pub sources: RwLock<Vec<SourceEntry>>,
    pub destinations: RwLock<Vec<DestinationEntry>>,
    pub raw_info: RwLock<RawInfo>,
    pub observers: RwLock<Vec<Arc<dyn EndpointObserver>>>,
    /// Bumped whenever the published data points change.
    pub revision: AtomicU64,
    /// Set when a stream awaits its open request.
    pub streams_dirty: AtomicBool,
    pub running: AtomicBool,
    pub next_port: AtomicU32,
    pub tick_stats: Mutex<TickStats>,
}

impl SharedState {
    pub fn new(name: String, address: EndpointAddress) -> Self {
        Self {
            name,
            address,
            streams: RwLock::new(StreamTable::default()),
            sources: RwLock::new(Vec::new()),
            destinations: RwLock::new(Vec::new()),
            raw_info: RwLock::new(RawInfo::default()),
            observers: RwLock::new(Vec::new()),
            revision: AtomicU64::new(1),
            streams_dirty: AtomicBool::new(false),
            running: AtomicBool::new(true),
            next_port: AtomicU32::new(0),
            tick_stats: Mutex::new(TickStats::default()),
        }
    }

    /// Allocates a stream port. Never returns the invalid port.
    pub fn allocate_port(&self) -> StreamPort {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if port != INVALID_STREAM_PORT {
                return port;
            }
        }
    }

    pub fn current_revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn local_data_points(&self) -> (Vec<DataPointInfo>, Vec<DataPointInfo>) {
        let sources = self.sources.read().iter().map(|s| s.info.clone()).collect();
        let destinations = self.destinations.read().iter().map(|d| d.info.clone()).collect();
        (sources, destinations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Guid;

    #[test]
    fn test_status_moves_forward_only() {
        use StreamStatus::{Active, Closed, RequestSent, Uninitialized};
        assert!(Uninitialized.can_transition_to(RequestSent));
        assert!(Uninitialized.can_transition_to(Active));
        assert!(RequestSent.can_transition_to(Closed));
        assert!(!Active.can_transition_to(RequestSent));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_closing_drops_stream_end() {
        let mut stream = StreamDescription::new(Guid::new(), Guid::new(), 1, EndpointAddress(2), true);
        assert!(stream.set_status(StreamStatus::RequestSent));
        assert!(stream.set_status(StreamStatus::Closed));
        assert!(matches!(stream.end, StreamEnd::None));
        assert!(!stream.set_status(StreamStatus::Active));
        assert_eq!(stream.status(), StreamStatus::Closed);
    }

    #[test]
    fn test_pruned_streams_keep_their_pair_history() {
        let (source, destination, peer) = (Guid::new(), Guid::new(), EndpointAddress(7));
        let mut table = StreamTable::default();
        for port in 1..=10 {
            let mut stream = StreamDescription::new(source, destination, port, peer, true);
            stream.set_status(StreamStatus::Closed);
            table.push(stream);
            assert_eq!(table.prune_closed(), 1);
        }
        assert_eq!(table.iter().count(), 0);
        assert_eq!(table.status(source, destination), Some(StreamStatus::Closed));
        assert!(table.was_closed_towards(source, destination, peer));
        assert!(!table.was_closed_towards(source, destination, EndpointAddress(8)));

        table.push(StreamDescription::new(source, destination, 11, peer, true));
        assert_eq!(table.prune_closed(), 0);
        assert_eq!(table.status(source, destination), Some(StreamStatus::Uninitialized));

        table.forget_data_point(source);
        assert!(!table.was_closed_towards(source, destination, peer));
    }

    #[test]
    fn test_ports_are_never_invalid() {
        let state = SharedState::new("ep".into(), EndpointAddress(1));
        state.next_port.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(state.allocate_port(), u32::MAX);
        assert_eq!(state.allocate_port(), 1);
    }
}
