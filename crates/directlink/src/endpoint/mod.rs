//! # Endpoint
//!
//! Process-wide coordinator owning sources and destinations, discovering
//! peers and driving the stream lifecycle.
//!
//! ## Threads
//!
//! ```text
//!  caller thread                    network thread
//!  ─────────────                    ──────────────
//!  add_source ──┐                 ┌── heartbeat / discovery
//!  open_stream ─┼─► SharedState ◄─┼── open requests, answers
//!  snapshot ────┘   (RwLocks)     └── diff + deltas, raw info
//!          │                           ▲
//!          └──── Command channel ──────┘
//! ```
//!
//! Caller operations only touch the shared state and set flags; the
//! network thread acts on them at its next tick.

mod state;
mod thread;
mod tick;

pub use state::{DataPointRawInfo, EndpointInfo, EndpointObserver, RawInfo, StreamInfo, StreamStatus};
pub use tick::{TickClock, TickStats};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::config::EndpointConfig;
use crate::diff::DiffStats;
use crate::error::{DirectLinkError, DirectLinkResult};
use crate::index::SceneIndexBuilder;
use crate::protocol::DataPointInfo;
use crate::scene::{SceneNode, SceneProvider};
use crate::transport::MessageBus;
use crate::types::{DataPointId, EndpointAddress, Guid, StreamPort, INVALID_STREAM_PORT};

use state::{DestinationEntry, SharedState, SourceEntry, StreamDescription, StreamEnd};
use thread::{Command, NetworkThread};

/// Outcome of [`Endpoint::open_stream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenStreamResult {
    /// Stream created; the request goes out on the next tick.
    Opened,
    /// A non-closed stream already connects the pair.
    AlreadyOpened,
    /// Neither a local nor a known remote data point matches.
    SourceAndDestinationNotFound,
    /// The pair does not span this endpoint and a known peer.
    RemoteEndpointNotFound,
    /// The remote data point is private.
    CannotConnectToPrivate,
}

/// A DirectLink endpoint.
///
/// Dropping it broadcasts `Stop` and joins the network thread.
pub struct Endpoint {
    shared: Arc<SharedState>,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Creates an endpoint on `bus` and starts its network thread.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the thread cannot start.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        config: EndpointConfig,
    ) -> DirectLinkResult<Self> {
        config.validate()?;
        let name = name.into();
        let shared = Arc::new(SharedState::new(name.clone(), bus.address()));
        let (commands, command_rx) = bounded(config.command_queue_capacity);

        let network = NetworkThread::new(Arc::clone(&shared), bus, config, command_rx);
        let thread = std::thread::Builder::new()
            .name(format!("directlink-{name}"))
            .spawn(move || network.run())
            .map_err(|e| DirectLinkError::ThreadSpawn(e.to_string()))?;

        tracing::info!(endpoint = %name, address = %shared.address, "endpoint: created");
        Ok(Self {
            shared,
            commands,
            thread: Some(thread),
        })
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Bus address.
    #[must_use]
    pub fn address(&self) -> EndpointAddress {
        self.shared.address
    }

    /// Declares a new source. It has no content until a root is set and
    /// snapshotted.
    pub fn add_source(&self, name: &str, is_public: bool) -> DataPointId {
        let id = Guid::new();
        self.shared.sources.write().push(SourceEntry {
            info: DataPointInfo {
                id,
                name: name.to_owned(),
                is_source: true,
                is_public,
            },
            root: None,
            index: None,
            snapshot_revision: 0,
        });
        self.shared.bump_revision();
        id
    }

    /// Removes a source, closing its streams first. Returns false if unknown.
    pub fn remove_source(&self, id: DataPointId) -> bool {
        let mut streams = self.shared.streams.write();
        let mut sources = self.shared.sources.write();
        let Some(position) = sources.iter().position(|s| s.info.id == id) else {
            return false;
        };
        for stream in streams.iter_mut().filter(|s| s.source_id == id) {
            self.close(stream);
        }
        streams.forget_data_point(id);
        sources.remove(position);
        drop(sources);
        drop(streams);
        self.shared.bump_revision();
        true
    }

    /// Sets the root node of a source's scene. Takes effect at the next
    /// [`snapshot_source`](Self::snapshot_source).
    pub fn set_source_root(&self, id: DataPointId, root: Option<Arc<dyn SceneNode>>) -> bool {
        let mut sources = self.shared.sources.write();
        let Some(source) = sources.iter_mut().find(|s| s.info.id == id) else {
            tracing::warn!(source = %id, "endpoint: set_source_root on unknown source");
            return false;
        };
        source.root = root;
        true
    }

    /// Indexes and captures the source's scene on the calling thread.
    ///
    /// The graph must not be mutated concurrently. Streams pick up the new
    /// snapshot on the next tick.
    pub fn snapshot_source(&self, id: DataPointId) -> bool {
        let root = {
            let sources = self.shared.sources.read();
            let Some(source) = sources.iter().find(|s| s.info.id == id) else {
                tracing::warn!(source = %id, "endpoint: snapshot of unknown source");
                return false;
            };
            source.root.clone()
        };

        let index = SceneIndexBuilder::build_index(root.as_ref());
        let captured = index.capture_all();

        let mut sources = self.shared.sources.write();
        let Some(source) = sources.iter_mut().find(|s| s.info.id == id) else {
            return false;
        };
        source.index = Some(Arc::new(index));
        source.snapshot_revision += 1;
        tracing::debug!(
            source = %id,
            nodes = captured,
            revision = source.snapshot_revision,
            "endpoint: source snapshotted"
        );
        true
    }

    /// Declares a new destination backed by `provider`.
    pub fn add_destination(
        &self,
        name: &str,
        is_public: bool,
        provider: Arc<dyn SceneProvider>,
    ) -> DataPointId {
        let id = Guid::new();
        self.shared.destinations.write().push(DestinationEntry {
            info: DataPointInfo {
                id,
                name: name.to_owned(),
                is_source: false,
                is_public,
            },
            provider,
        });
        self.shared.bump_revision();
        id
    }

    /// Removes a destination, closing its streams first. Returns false if
    /// unknown.
    pub fn remove_destination(&self, id: DataPointId) -> bool {
        let mut streams = self.shared.streams.write();
        let mut destinations = self.shared.destinations.write();
        let Some(position) = destinations.iter().position(|d| d.info.id == id) else {
            return false;
        };
        for stream in streams.iter_mut().filter(|s| s.destination_id == id) {
            self.close(stream);
        }
        streams.forget_data_point(id);
        destinations.remove(position);
        drop(destinations);
        drop(streams);
        self.shared.bump_revision();
        true
    }

    /// Requests a stream between a local and a remote data point.
    ///
    /// Either side may be the local one. The remote one must be known
    /// through discovery.
    pub fn open_stream(&self, source: DataPointId, destination: DataPointId) -> OpenStreamResult {
        let mut streams = self.shared.streams.write();
        if streams.iter().any(|s| s.is_open() && s.connects(source, destination)) {
            return OpenStreamResult::AlreadyOpened;
        }

        let local_source = self.shared.sources.read().iter().any(|s| s.info.id == source);
        let local_destination = self
            .shared
            .destinations
            .read()
            .iter()
            .any(|d| d.info.id == destination);

        let raw_info = self.shared.raw_info.read();
        let (remote_id, local_is_source) = match (local_source, local_destination) {
            (true, true) => return OpenStreamResult::RemoteEndpointNotFound,
            (true, false) => (destination, true),
            (false, true) => (source, false),
            (false, false) => return OpenStreamResult::SourceAndDestinationNotFound,
        };
        let Some(remote) = raw_info
            .data_point(remote_id)
            .filter(|d| !d.is_local && d.info.is_source != local_is_source)
        else {
            return OpenStreamResult::SourceAndDestinationNotFound;
        };
        if !raw_info.endpoints.iter().any(|e| e.address == remote.owner) {
            return OpenStreamResult::RemoteEndpointNotFound;
        }
        if !remote.info.is_public {
            return OpenStreamResult::CannotConnectToPrivate;
        }
        let peer = remote.owner;
        drop(raw_info);

        let port = self.shared.allocate_port();
        streams.push(StreamDescription::new(source, destination, port, peer, local_is_source));
        self.shared.streams_dirty.store(true, Ordering::Release);
        tracing::info!(port, peer = %peer, "endpoint: stream requested");
        OpenStreamResult::Opened
    }

    /// Closes the stream connecting the pair and notifies the peer. Returns
    /// false if no open stream connects them.
    pub fn close_stream(&self, source: DataPointId, destination: DataPointId) -> bool {
        let mut streams = self.shared.streams.write();
        let Some(stream) = streams
            .iter_mut()
            .find(|s| s.is_open() && s.connects(source, destination))
        else {
            return false;
        };
        self.close(stream);
        true
    }

    /// Status of the most recent stream connecting the pair.
    #[must_use]
    pub fn stream_status(&self, source: DataPointId, destination: DataPointId) -> Option<StreamStatus> {
        self.shared.streams.read().status(source, destination)
    }

    /// Diff counters of the live stream sending `source` to `destination`,
    /// summed since the stream opened. `None` unless this endpoint owns the
    /// source end.
    #[must_use]
    pub fn sync_stats(&self, source: DataPointId, destination: DataPointId) -> Option<DiffStats> {
        self.shared
            .streams
            .read()
            .iter()
            .rev()
            .filter(|s| s.is_open() && s.connects(source, destination))
            .find_map(|s| match &s.end {
                StreamEnd::Sender(sender) => Some(sender.totals()),
                _ => None,
            })
    }

    /// Registers an observer of [`RawInfo`] changes.
    pub fn add_observer(&self, observer: Arc<dyn EndpointObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Unregisters an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn EndpointObserver>) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    /// Copy of the last published [`RawInfo`].
    #[must_use]
    pub fn raw_info(&self) -> RawInfo {
        self.shared.raw_info.read().clone()
    }

    /// Network thread timing.
    #[must_use]
    pub fn tick_stats(&self) -> TickStats {
        *self.shared.tick_stats.lock()
    }

    /// Marks a stream closed and queues the peer notification.
    fn close(&self, stream: &mut StreamDescription) {
        if !stream.is_open() {
            return;
        }
        let notify = stream.status() == StreamStatus::Active && stream.remote_port != INVALID_STREAM_PORT;
        let (peer, remote_port) = (stream.peer, stream.remote_port);
        stream.set_status(StreamStatus::Closed);
        if notify {
            self.notify_close(peer, remote_port);
        }
    }

    fn notify_close(&self, peer: EndpointAddress, remote_port: StreamPort) {
        match self.commands.try_send(Command::NotifyClose { peer, remote_port }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(peer = %peer, port = remote_port, "endpoint: command queue full, close not notified");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(peer = %peer, "endpoint: network thread gone, close not notified");
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        // Disconnection also stops the thread if the queue is full.
        let _ = self.commands.try_send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(endpoint = %self.shared.name, "endpoint: network thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MemoryNode, MemorySceneProvider};
    use crate::transport::LocalHub;

    fn endpoint(hub: &LocalHub, name: &str) -> Endpoint {
        let config = EndpointConfig {
            auto_connect: false,
            ..EndpointConfig::default()
        };
        Endpoint::new(name, Arc::new(hub.connect()), config).expect("endpoint")
    }

    #[test]
    fn test_invalid_config_refused() {
        let hub = LocalHub::new();
        let config = EndpointConfig {
            tick_wait_ms: 0,
            ..EndpointConfig::default()
        };
        assert!(Endpoint::new("bad", Arc::new(hub.connect()), config).is_err());
    }

    #[test]
    fn test_open_stream_unknown_pair() {
        let hub = LocalHub::new();
        let ep = endpoint(&hub, "a");
        assert_eq!(
            ep.open_stream(Guid::new(), Guid::new()),
            OpenStreamResult::SourceAndDestinationNotFound
        );
    }

    #[test]
    fn test_open_stream_between_local_points_refused() {
        let hub = LocalHub::new();
        let ep = endpoint(&hub, "a");
        let source = ep.add_source("scene", true);
        let destination = ep.add_destination("scene", true, Arc::new(MemorySceneProvider::new()));
        assert_eq!(
            ep.open_stream(source, destination),
            OpenStreamResult::RemoteEndpointNotFound
        );
        assert!(ep.stream_status(source, destination).is_none());
    }

    #[test]
    fn test_data_points_bump_revision() {
        let hub = LocalHub::new();
        let ep = endpoint(&hub, "a");
        let before = ep.shared.current_revision();
        let source = ep.add_source("scene", true);
        assert!(ep.shared.current_revision() > before);
        assert!(ep.remove_source(source));
        assert!(!ep.remove_source(source));
    }

    #[test]
    fn test_snapshot_source() {
        let hub = LocalHub::new();
        let ep = endpoint(&hub, "a");
        let source = ep.add_source("scene", true);
        assert!(!ep.snapshot_source(Guid::new()));

        let root = MemoryNode::new("root");
        let child = MemoryNode::new("child");
        root.add_reference("children", &child);
        let root: Arc<dyn SceneNode> = root;
        assert!(ep.set_source_root(source, Some(root)));
        assert!(ep.snapshot_source(source));
        assert!(ep.snapshot_source(source));

        let sources = ep.shared.sources.read();
        let entry = &sources[0];
        assert_eq!(entry.snapshot_revision, 2);
        assert_eq!(entry.index.as_ref().map(|i| i.len()), Some(2));
    }

    #[test]
    fn test_observers_removed_by_identity() {
        struct Quiet;
        impl EndpointObserver for Quiet {
            fn on_state_changed(&self, _info: &RawInfo) {}
        }

        let hub = LocalHub::new();
        let ep = endpoint(&hub, "a");
        let observer: Arc<dyn EndpointObserver> = Arc::new(Quiet);
        let other: Arc<dyn EndpointObserver> = Arc::new(Quiet);
        ep.add_observer(Arc::clone(&observer));
        assert!(!ep.remove_observer(&other));
        assert!(ep.remove_observer(&observer));
    }
}
