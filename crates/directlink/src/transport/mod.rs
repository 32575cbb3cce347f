//! # Transport Layer
//!
//! Message bus capability consumed by the endpoint, plus an in-process
//! implementation.
//!
//! ## Design
//!
//! - Reliable point-to-point `send` and best-effort `publish`
//! - One inbox per endpoint, drained by its network thread
//! - Addresses are opaque; the bus never interprets payloads
//!
//! ```text
//!  Endpoint A ──┐                 ┌──► inbox A
//!               ├──► LocalHub ────┤
//!  Endpoint B ──┘                 └──► inbox B
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{DirectLinkError, DirectLinkResult};
use crate::protocol::Message;
use crate::types::EndpointAddress;

/// One received message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Sender address.
    pub from: EndpointAddress,
    /// Encoded message.
    pub bytes: Vec<u8>,
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages sent point to point.
    pub messages_sent: u64,
    /// Messages published.
    pub messages_published: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes sent or published.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Sends that failed.
    pub send_errors: u64,
}

/// Addressing and delivery, as seen by one endpoint.
pub trait MessageBus: Send + Sync {
    /// Address of this participant.
    fn address(&self) -> EndpointAddress;

    /// Delivers `bytes` to every other participant.
    fn publish(&self, bytes: &[u8]) -> DirectLinkResult<()>;

    /// Delivers `bytes` to `to`, in order with earlier sends to `to`.
    fn send(&self, to: EndpointAddress, bytes: &[u8]) -> DirectLinkResult<()>;

    /// Waits up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> Option<Envelope>;

    /// Counters since creation.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Encodes and sends one message, logging failures.
pub fn send_message(bus: &dyn MessageBus, to: EndpointAddress, message: &Message) -> bool {
    match bus.send(to, &message.encode()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(to = %to, kind = ?message.kind(), error = %e, "transport: send failed");
            false
        }
    }
}

/// Encodes and publishes one message, logging failures.
pub fn publish_message(bus: &dyn MessageBus, message: &Message) -> bool {
    match bus.publish(&message.encode()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(kind = ?message.kind(), error = %e, "transport: publish failed");
            false
        }
    }
}

#[derive(Default)]
struct HubInner {
    inboxes: RwLock<HashMap<EndpointAddress, Sender<Envelope>>>,
    next_address: AtomicU64,
}

/// In-process message bus connecting any number of [`LocalBus`]es.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new participant.
    #[must_use]
    pub fn connect(&self) -> LocalBus {
        let address = EndpointAddress(self.inner.next_address.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = unbounded();
        self.inner.inboxes.write().insert(address, tx);
        LocalBus {
            address,
            hub: Arc::clone(&self.inner),
            inbox: rx,
            stats: Mutex::new(TransportStats::default()),
        }
    }

    /// Number of connected participants.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.inner.inboxes.read().len()
    }
}

/// One participant of a [`LocalHub`]. Dropping it unregisters it.
pub struct LocalBus {
    address: EndpointAddress,
    hub: Arc<HubInner>,
    inbox: Receiver<Envelope>,
    stats: Mutex<TransportStats>,
}

impl MessageBus for LocalBus {
    fn address(&self) -> EndpointAddress {
        self.address
    }

    fn publish(&self, bytes: &[u8]) -> DirectLinkResult<()> {
        let inboxes = self.hub.inboxes.read();
        for (address, inbox) in inboxes.iter() {
            if *address == self.address {
                continue;
            }
            // A participant dropping concurrently is not an error for a broadcast.
            let _ = inbox.send(Envelope {
                from: self.address,
                bytes: bytes.to_vec(),
            });
        }
        let mut stats = self.stats.lock();
        stats.messages_published += 1;
        stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    fn send(&self, to: EndpointAddress, bytes: &[u8]) -> DirectLinkResult<()> {
        let result = match self.hub.inboxes.read().get(&to) {
            Some(inbox) => inbox
                .send(Envelope {
                    from: self.address,
                    bytes: bytes.to_vec(),
                })
                .map_err(|_| DirectLinkError::BusDisconnected),
            None => Err(DirectLinkError::UnknownRecipient(to)),
        };
        let mut stats = self.stats.lock();
        if result.is_ok() {
            stats.messages_sent += 1;
            stats.bytes_sent += bytes.len() as u64;
        } else {
            stats.send_errors += 1;
        }
        result
    }

    fn receive(&self, timeout: Duration) -> Option<Envelope> {
        match self.inbox.recv_timeout(timeout) {
            Ok(envelope) => {
                let mut stats = self.stats.lock();
                stats.messages_received += 1;
                stats.bytes_received += envelope.bytes.len() as u64;
                Some(envelope)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn stats(&self) -> TransportStats {
        *self.stats.lock()
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.hub.inboxes.write().remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn test_send_reaches_only_recipient() {
        let hub = LocalHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let c = hub.connect();

        a.send(b.address(), b"hello").unwrap();
        let envelope = b.receive(WAIT).unwrap();
        assert_eq!(envelope.from, a.address());
        assert_eq!(envelope.bytes, b"hello");
        assert!(c.receive(Duration::ZERO).is_none());
    }

    #[test]
    fn test_publish_skips_sender() {
        let hub = LocalHub::new();
        let a = hub.connect();
        let b = hub.connect();

        a.publish(b"all").unwrap();
        assert!(b.receive(WAIT).is_some());
        assert!(a.receive(Duration::ZERO).is_none());
        assert_eq!(a.stats().messages_published, 1);
    }

    #[test]
    fn test_dropped_participant_is_unknown() {
        let hub = LocalHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let gone = b.address();
        drop(b);

        assert_eq!(hub.participant_count(), 1);
        assert_eq!(a.send(gone, b"x"), Err(DirectLinkError::UnknownRecipient(gone)));
        assert_eq!(a.stats().send_errors, 1);
    }

    #[test]
    fn test_send_preserves_order() {
        let hub = LocalHub::new();
        let a = hub.connect();
        let b = hub.connect();
        for i in 0..10u8 {
            a.send(b.address(), &[i]).unwrap();
        }
        let received: Vec<u8> = (0..10).filter_map(|_| b.receive(WAIT)).map(|e| e.bytes[0]).collect();
        assert_eq!(received, (0..10).collect::<Vec<u8>>());
    }
}
