//! # Network Thread
//!
//! One dedicated thread per endpoint. Every tick waits on the bus for at
//! most `tick_wait`, then:
//!
//! 1. Drains caller commands
//! 2. Broadcasts a heartbeat when due
//! 3. Handles incoming messages (bounded wait when idle)
//! 4. Sends pending open requests and applies auto-connect
//! 5. Runs the diff of every idle sender and prunes closed streams
//! 6. Republishes the raw info and notifies observers if it changed
//!
//! Only the work after the wait is measured by the [`TickClock`].
//!
//! Failures are logged and contained; nothing unwinds out of the loop.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use super::state::{
    DataPointRawInfo, EndpointInfo, RawInfo, SharedState, StreamDescription, StreamEnd, StreamInfo,
    StreamStatus,
};
use super::tick::TickClock;
use crate::config::EndpointConfig;
use crate::protocol::{
    DeltaEvent, EndpointStateMessage, FrameHeader, HaveListEvent, LifecycleKind, Message,
};
use crate::stream::{OutboundLink, StreamReceiver, StreamSender};
use crate::transport::{publish_message, send_message, Envelope, MessageBus};
use crate::types::{DataPointId, EndpointAddress, StreamPort};

/// Upper bound of messages handled in one tick.
const MAX_MESSAGES_PER_TICK: usize = 1024;

/// Command from the caller thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    /// Tell `peer` that its stream end `remote_port` is closed.
    NotifyClose {
        /// Remote endpoint.
        peer: EndpointAddress,
        /// Remote port.
        remote_port: StreamPort,
    },
    /// Stop the thread.
    Shutdown,
}

/// What this endpoint knows about one peer.
#[derive(Default)]
struct RemotePeer {
    queried_revision: Option<u64>,
    queried_at: Option<Instant>,
    state: Option<EndpointStateMessage>,
}

impl RemotePeer {
    /// Returns true if the state at `revision` should be queried. A query
    /// left unanswered for longer than `patience` is sent again.
    fn needs_query(&self, revision: u64, now: Instant, patience: Duration) -> bool {
        if self.state.as_ref().map(|s| s.revision) == Some(revision) {
            return false;
        }
        if self.queried_revision != Some(revision) {
            return true;
        }
        self.queried_at
            .is_some_and(|at| now.saturating_duration_since(at) > patience)
    }

    fn mark_queried(&mut self, revision: u64, now: Instant) {
        self.queried_revision = Some(revision);
        self.queried_at = Some(now);
    }

    fn store_state(&mut self, state: EndpointStateMessage) {
        self.queried_at = None;
        self.state = Some(state);
    }
}

/// The network thread's private state.
pub(crate) struct NetworkThread {
    shared: Arc<SharedState>,
    bus: Arc<dyn MessageBus>,
    config: EndpointConfig,
    commands: Receiver<Command>,
    peers: BTreeMap<EndpointAddress, RemotePeer>,
    clock: TickClock,
    last_heartbeat: Instant,
}

impl NetworkThread {
    pub fn new(
        shared: Arc<SharedState>,
        bus: Arc<dyn MessageBus>,
        config: EndpointConfig,
        commands: Receiver<Command>,
    ) -> Self {
        let clock = TickClock::new(config.tick_budget());
        Self {
            shared,
            bus,
            config,
            commands,
            peers: BTreeMap::new(),
            clock,
            last_heartbeat: Instant::now(),
        }
    }

    /// Runs until shutdown.
    pub fn run(mut self) {
        tracing::info!(endpoint = %self.shared.name, address = %self.shared.address, "endpoint: network thread started");
        self.publish_lifecycle(LifecycleKind::Start);

        while self.shared.running.load(Ordering::Acquire) {
            if !self.tick() {
                break;
            }
        }

        self.publish_lifecycle(LifecycleKind::Stop);
        tracing::info!(endpoint = %self.shared.name, "endpoint: network thread stopped");
    }

    /// One pass of the loop. Returns false on shutdown.
    fn tick(&mut self) -> bool {
        let first = self.bus.receive(self.config.tick_wait());
        let start = self.clock.begin_tick();

        if !self.drain_commands() {
            return false;
        }
        if self.last_heartbeat.elapsed() >= self.config.heartbeat_interval() {
            self.publish_lifecycle(LifecycleKind::Heartbeat);
        }

        let handled = self.receive_messages(first);

        if self.config.auto_connect {
            self.auto_connect();
        }
        if self.shared.streams_dirty.swap(false, Ordering::AcqRel) {
            self.send_open_requests();
        }
        self.sync_senders();
        self.prune_streams();
        self.publish_raw_info();

        self.clock.end_tick(start, handled as u64);
        *self.shared.tick_stats.lock() = *self.clock.stats();
        true
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::NotifyClose { peer, remote_port }) => {
                    send_message(
                        self.bus.as_ref(),
                        peer,
                        &Message::CloseStreamRequest {
                            recipient_port: remote_port,
                        },
                    );
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn publish_lifecycle(&mut self, kind: LifecycleKind) {
        let message = Message::Lifecycle {
            kind,
            revision: self.shared.current_revision(),
        };
        publish_message(self.bus.as_ref(), &message);
        self.last_heartbeat = Instant::now();
    }

    /// Handles `first` and whatever else is already queued, without waiting.
    fn receive_messages(&mut self, first: Option<Envelope>) -> usize {
        let Some(envelope) = first else {
            return 0;
        };
        self.handle_envelope(envelope);
        let mut handled = 1;
        while handled < MAX_MESSAGES_PER_TICK {
            let Some(envelope) = self.bus.receive(Duration::ZERO) else {
                break;
            };
            self.handle_envelope(envelope);
            handled += 1;
        }
        handled
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        let from = envelope.from;
        let message = match Message::decode(&envelope.bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "endpoint: undecodable message dropped");
                return;
            }
        };
        match message {
            Message::Lifecycle { kind, revision } => self.on_lifecycle(from, kind, revision),
            Message::QueryEndpointState => self.on_query(from),
            Message::EndpointState(state) => self.on_endpoint_state(from, state),
            Message::OpenStreamRequest {
                from_source,
                source_id,
                destination_id,
                request_port,
            } => self.on_open_request(from, from_source, source_id, destination_id, request_port),
            Message::OpenStreamAnswer {
                recipient_port,
                accepted,
                opened_port,
            } => self.on_open_answer(from, recipient_port, accepted, opened_port),
            Message::CloseStreamRequest { recipient_port } => self.on_close_request(recipient_port),
            Message::Delta { header, event } => self.on_delta(header, event),
            Message::HaveList { header, event } => self.on_have_list(header, event),
        }
    }

    fn on_lifecycle(&mut self, from: EndpointAddress, kind: LifecycleKind, revision: u64) {
        match kind {
            LifecycleKind::Start => {
                tracing::info!(peer = %from, "endpoint: peer started");
                self.peers.insert(from, RemotePeer::default());
                // Let the newcomer learn about us without waiting a heartbeat.
                send_message(
                    self.bus.as_ref(),
                    from,
                    &Message::Lifecycle {
                        kind: LifecycleKind::Heartbeat,
                        revision: self.shared.current_revision(),
                    },
                );
                self.observe_revision(from, revision);
            }
            LifecycleKind::Heartbeat => self.observe_revision(from, revision),
            LifecycleKind::Stop => self.forget_peer(from),
        }
    }

    /// Queries the peer's state if `revision` differs from what we have.
    fn observe_revision(&mut self, from: EndpointAddress, revision: u64) {
        let now = Instant::now();
        let peer = self.peers.entry(from).or_default();
        if peer.needs_query(revision, now, self.config.heartbeat_interval()) {
            if peer.queried_revision == Some(revision) {
                tracing::debug!(peer = %from, revision, "endpoint: state query unanswered, asking again");
            }
            peer.mark_queried(revision, now);
            send_message(self.bus.as_ref(), from, &Message::QueryEndpointState);
        }
    }

    fn forget_peer(&mut self, from: EndpointAddress) {
        if self.peers.remove(&from).is_none() {
            return;
        }
        tracing::info!(peer = %from, "endpoint: peer stopped");
        let mut streams = self.shared.streams.write();
        for stream in streams.iter_mut().filter(|s| s.peer == from && s.is_open()) {
            stream.set_status(StreamStatus::Closed);
        }
    }

    fn on_query(&mut self, from: EndpointAddress) {
        let (sources, destinations) = self.shared.local_data_points();
        let state = EndpointStateMessage {
            name: self.shared.name.clone(),
            revision: self.shared.current_revision(),
            sources,
            destinations,
        };
        send_message(self.bus.as_ref(), from, &Message::EndpointState(state));
    }

    fn on_endpoint_state(&mut self, from: EndpointAddress, state: EndpointStateMessage) {
        tracing::debug!(
            peer = %from,
            name = %state.name,
            revision = state.revision,
            sources = state.sources.len(),
            destinations = state.destinations.len(),
            "endpoint: peer state received"
        );
        self.peers.entry(from).or_default().store_state(state);
    }

    fn on_open_request(
        &mut self,
        from: EndpointAddress,
        from_source: bool,
        source_id: DataPointId,
        destination_id: DataPointId,
        request_port: StreamPort,
    ) {
        let opened_port = self.accept_stream(from, from_source, source_id, destination_id, request_port);
        let accepted = opened_port.is_some();
        tracing::info!(peer = %from, accepted, "endpoint: open stream request");
        send_message(
            self.bus.as_ref(),
            from,
            &Message::OpenStreamAnswer {
                recipient_port: request_port,
                accepted,
                opened_port: opened_port.unwrap_or_default(),
            },
        );
    }

    /// Creates the answering stream end. Returns its port if accepted.
    fn accept_stream(
        &mut self,
        from: EndpointAddress,
        from_source: bool,
        source_id: DataPointId,
        destination_id: DataPointId,
        request_port: StreamPort,
    ) -> Option<StreamPort> {
        let mut streams = self.shared.streams.write();
        if streams.iter().any(|s| s.is_open() && s.connects(source_id, destination_id)) {
            tracing::warn!(peer = %from, "endpoint: duplicate stream refused");
            return None;
        }

        let link = |port| OutboundLink::new(Arc::clone(&self.bus), from, port);
        let end = if from_source {
            let destinations = self.shared.destinations.read();
            let destination = destinations.iter().find(|d| d.info.id == destination_id)?;
            if !destination.info.is_public || !destination.provider.can_open_new_connection() {
                return None;
            }
            StreamEnd::Receiver(Box::new(StreamReceiver::new(
                link(request_port),
                Arc::clone(&destination.provider),
                self.config.have_list_batch_size,
            )))
        } else {
            let sources = self.shared.sources.read();
            let source = sources.iter().find(|s| s.info.id == source_id)?;
            if !source.info.is_public {
                return None;
            }
            StreamEnd::Sender(Box::new(StreamSender::new(link(request_port))))
        };

        let port = self.shared.allocate_port();
        let mut stream = StreamDescription::new(source_id, destination_id, port, from, !from_source);
        stream.remote_port = request_port;
        stream.set_status(StreamStatus::Active);
        stream.end = end;
        streams.push(stream);
        Some(port)
    }

    fn on_open_answer(
        &mut self,
        from: EndpointAddress,
        recipient_port: StreamPort,
        accepted: bool,
        opened_port: StreamPort,
    ) {
        let mut streams = self.shared.streams.write();
        let status = streams
            .iter()
            .find(|s| s.local_port == recipient_port)
            .map(StreamDescription::status);
        match status {
            Some(StreamStatus::RequestSent) => {}
            // Closed locally (and maybe pruned) while the request was in flight.
            None | Some(StreamStatus::Closed) => {
                drop(streams);
                if accepted {
                    send_message(
                        self.bus.as_ref(),
                        from,
                        &Message::CloseStreamRequest {
                            recipient_port: opened_port,
                        },
                    );
                }
                return;
            }
            Some(_) => return,
        }
        let Some(stream) = streams.iter_mut().find(|s| s.local_port == recipient_port) else {
            return;
        };
        if !accepted {
            tracing::info!(port = recipient_port, "endpoint: stream refused by peer");
            stream.set_status(StreamStatus::Closed);
            return;
        }

        let link = OutboundLink::new(Arc::clone(&self.bus), from, opened_port);
        let end = if stream.local_is_source {
            StreamEnd::Sender(Box::new(StreamSender::new(link)))
        } else {
            let destinations = self.shared.destinations.read();
            let Some(destination) = destinations.iter().find(|d| d.info.id == stream.destination_id) else {
                stream.set_status(StreamStatus::Closed);
                return;
            };
            StreamEnd::Receiver(Box::new(StreamReceiver::new(
                link,
                Arc::clone(&destination.provider),
                self.config.have_list_batch_size,
            )))
        };
        stream.remote_port = opened_port;
        stream.set_status(StreamStatus::Active);
        stream.end = end;
    }

    fn on_close_request(&mut self, recipient_port: StreamPort) {
        let mut streams = self.shared.streams.write();
        if let Some(stream) = streams
            .iter_mut()
            .find(|s| s.local_port == recipient_port && s.is_open())
        {
            tracing::info!(port = recipient_port, "endpoint: stream closed by peer");
            stream.set_status(StreamStatus::Closed);
        }
    }

    fn on_delta(&mut self, header: FrameHeader, event: DeltaEvent) {
        let mut streams = self.shared.streams.write();
        let Some(stream) = streams
            .iter_mut()
            .find(|s| s.local_port == header.stream_port && s.status() == StreamStatus::Active)
        else {
            tracing::debug!(port = header.stream_port, "endpoint: delta for inactive stream ignored");
            return;
        };
        let StreamEnd::Receiver(receiver) = &mut stream.end else {
            tracing::warn!(port = header.stream_port, "endpoint: delta sent to a source end");
            return;
        };
        if !receiver.on_delta(header, event) {
            let (peer, remote_port) = (stream.peer, stream.remote_port);
            stream.set_status(StreamStatus::Closed);
            drop(streams);
            send_message(
                self.bus.as_ref(),
                peer,
                &Message::CloseStreamRequest {
                    recipient_port: remote_port,
                },
            );
        }
    }

    fn on_have_list(&mut self, header: FrameHeader, event: HaveListEvent) {
        let mut streams = self.shared.streams.write();
        let Some(stream) = streams
            .iter_mut()
            .find(|s| s.local_port == header.stream_port && s.status() == StreamStatus::Active)
        else {
            tracing::debug!(port = header.stream_port, "endpoint: have-list for inactive stream ignored");
            return;
        };
        match &mut stream.end {
            StreamEnd::Sender(sender) => sender.on_have_list(header, event),
            _ => tracing::warn!(port = header.stream_port, "endpoint: have-list sent to a destination end"),
        }
    }

    /// Opens a stream from every local public source to every remote public
    /// destination with the same name.
    fn auto_connect(&mut self) {
        let mut wanted: Vec<(DataPointId, DataPointId, EndpointAddress)> = Vec::new();
        {
            let sources = self.shared.sources.read();
            for source in sources.iter().filter(|s| s.info.is_public) {
                for (address, peer) in &self.peers {
                    let Some(state) = &peer.state else {
                        continue;
                    };
                    wanted.extend(
                        state
                            .destinations
                            .iter()
                            .filter(|d| d.is_public && d.name == source.info.name)
                            .map(|d| (source.info.id, d.id, *address)),
                    );
                }
            }
        }
        if wanted.is_empty() {
            return;
        }

        let mut streams = self.shared.streams.write();
        for (source_id, destination_id, peer) in wanted {
            // A closed stream to the same peer is not reopened.
            if streams
                .iter()
                .any(|s| s.is_open() && s.connects(source_id, destination_id))
                || streams.was_closed_towards(source_id, destination_id, peer)
            {
                continue;
            }
            tracing::info!(peer = %peer, "endpoint: auto-connecting source to destination of same name");
            let port = self.shared.allocate_port();
            streams.push(StreamDescription::new(source_id, destination_id, port, peer, true));
            self.shared.streams_dirty.store(true, Ordering::Release);
        }
    }

    fn send_open_requests(&mut self) {
        let mut streams = self.shared.streams.write();
        for stream in streams
            .iter_mut()
            .filter(|s| s.status() == StreamStatus::Uninitialized)
        {
            let request = Message::OpenStreamRequest {
                from_source: stream.local_is_source,
                source_id: stream.source_id,
                destination_id: stream.destination_id,
                request_port: stream.local_port,
            };
            if send_message(self.bus.as_ref(), stream.peer, &request) {
                stream.set_status(StreamStatus::RequestSent);
            } else {
                stream.set_status(StreamStatus::Closed);
            }
        }
    }

    fn sync_senders(&mut self) {
        let mut streams = self.shared.streams.write();
        let sources = self.shared.sources.read();
        for stream in streams
            .iter_mut()
            .filter(|s| s.status() == StreamStatus::Active)
        {
            let StreamEnd::Sender(sender) = &mut stream.end else {
                continue;
            };
            let Some(source) = sources.iter().find(|s| s.info.id == stream.source_id) else {
                continue;
            };
            if let Some(stats) = sender.sync(source.index.as_deref(), source.snapshot_revision) {
                tracing::debug!(
                    port = stream.local_port,
                    sent = stats.sent,
                    skipped = stats.skipped,
                    removed = stats.removed,
                    "endpoint: delta sent"
                );
            }
        }
    }

    fn prune_streams(&mut self) {
        let pruned = self.shared.streams.write().prune_closed();
        if pruned > 0 {
            tracing::debug!(pruned, "endpoint: closed streams pruned");
        }
    }

    fn build_raw_info(&self) -> RawInfo {
        let local = self.shared.address;
        let mut info = RawInfo::default();
        info.endpoints.push(EndpointInfo {
            name: self.shared.name.clone(),
            address: local,
            is_local: true,
        });

        let streams = self.shared.streams.read();
        let (sources, destinations) = self.shared.local_data_points();
        info.data_points
            .extend(sources.into_iter().chain(destinations).map(|point| DataPointRawInfo {
                info: point,
                owner: local,
                is_local: true,
            }));

        for (address, peer) in &self.peers {
            let Some(state) = &peer.state else {
                continue;
            };
            info.endpoints.push(EndpointInfo {
                name: state.name.clone(),
                address: *address,
                is_local: false,
            });
            info.data_points.extend(
                state
                    .sources
                    .iter()
                    .chain(&state.destinations)
                    .map(|point| DataPointRawInfo {
                        info: point.clone(),
                        owner: *address,
                        is_local: false,
                    }),
            );
        }

        info.streams.extend(streams.iter().map(|s| StreamInfo {
            source: s.source_id,
            destination: s.destination_id,
            port: s.local_port,
            status: s.status(),
        }));
        info
    }

    fn publish_raw_info(&mut self) {
        let info = self.build_raw_info();
        {
            let mut published = self.shared.raw_info.write();
            if *published == info {
                return;
            }
            *published = info.clone();
        }
        let observers = self.shared.observers.read().clone();
        for observer in observers {
            observer.on_state_changed(&info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(revision: u64) -> EndpointStateMessage {
        EndpointStateMessage {
            name: "peer".into(),
            revision,
            sources: Vec::new(),
            destinations: Vec::new(),
        }
    }

    #[test]
    fn test_query_sent_once_per_revision() {
        let patience = Duration::from_millis(100);
        let now = Instant::now();
        let mut peer = RemotePeer::default();
        assert!(peer.needs_query(3, now, patience));
        peer.mark_queried(3, now);
        assert!(!peer.needs_query(3, now + Duration::from_millis(50), patience));
        assert!(peer.needs_query(4, now + Duration::from_millis(50), patience));
    }

    #[test]
    fn test_unanswered_query_is_repeated() {
        let patience = Duration::from_millis(100);
        let now = Instant::now();
        let mut peer = RemotePeer::default();
        peer.mark_queried(3, now);
        assert!(peer.needs_query(3, now + Duration::from_millis(150), patience));

        peer.store_state(state(3));
        assert!(!peer.needs_query(3, now + Duration::from_millis(500), patience));
    }
}
