//! # DirectLink - Scene Synchronization
//!
//! Keeps a graph of typed, attributed nodes consistent between a producing
//! process (source) and any number of consuming processes (destinations).
//!
//! ## Architecture
//!
//! - **Snapshot**: immutable, hashable capture of one node (`0xD1` wire format)
//! - **Index**: every node reachable from a root, hashed lazily
//! - **Diff**: minimal delta against what the remote already has
//! - **Stream**: ordered, batched delta delivery over an unordered bus
//! - **Endpoint**: discovery, stream lifecycle, one network thread
//!
//! ## Data Flow
//!
//! ```text
//! SOURCE                                         DESTINATION
//!   |                                                 |
//!   | build_index → do_diff                           |
//!   |--- OpenDelta / SetElement* / CloseDelta ------->| reorder → consumer
//!   |<-- HaveList (what the destination holds) -------|
//!   |                                                 |
//! ```
//!
//! Unchanged nodes are never resent: the source only sends elements whose
//! hash differs from the destination's have-list.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use directlink::{Endpoint, EndpointConfig, LocalHub, MemoryNode, MemorySceneProvider};
//!
//! let hub = LocalHub::new();
//! let source = Endpoint::new("editor", Arc::new(hub.connect()), EndpointConfig::default())?;
//! let viewer = Endpoint::new("viewer", Arc::new(hub.connect()), EndpointConfig::default())?;
//!
//! let scene = source.add_source("level", true);
//! viewer.add_destination("level", true, Arc::new(MemorySceneProvider::new()));
//!
//! source.set_source_root(scene, Some(MemoryNode::new("root")));
//! source.snapshot_source(scene); // auto-connect does the rest
//! ```

pub mod config;
pub mod delta;
pub mod diff;
pub mod endpoint;
pub mod error;
pub mod index;
pub mod protocol;
pub mod scene;
pub mod snapshot;
pub mod stream;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::EndpointConfig;
pub use delta::{DeltaConsumer, DeltaProducer, SceneReconstructor};
pub use diff::{do_diff, DiffStats, RemoteScene};
pub use endpoint::{Endpoint, EndpointObserver, OpenStreamResult, RawInfo, StreamStatus};
pub use error::{DirectLinkError, DirectLinkResult};
pub use index::{LocalSceneIndex, SceneIndexBuilder};
pub use scene::{MemoryNode, MemoryScene, MemorySceneProvider, SceneNode, SceneProvider};
pub use snapshot::ElementSnapshot;
pub use transport::{LocalBus, LocalHub, MessageBus};
pub use types::{DataPointId, ElementHash, EndpointAddress, Guid, NodeId, SceneIdentifier};

/// Wire protocol version written in every snapshot.
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest snapshot version still readable.
///
/// Equal to [`PROTOCOL_VERSION`]: versions are pinned until a reader for
/// older layouts exists.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u8 = 1;
