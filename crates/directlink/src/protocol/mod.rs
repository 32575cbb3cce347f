//! # Wire Protocol
//!
//! Little-endian binary encoding of snapshots and control messages.
//!
//! ## Stream Message Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Kind (1 byte)                                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Frame Header (12 bytes)                                      │
//! │ StreamPort (4) │ BatchCode (4) │ MessageCode (4)             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Event tag (1) │ Payload (variable)                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Endpoint control messages carry the kind byte and their payload only.

mod messages;
mod serialization;

pub use messages::{
    DataPointInfo, DeltaEvent, EndpointStateMessage, FrameHeader, HaveListEvent, LifecycleKind,
    Message, MessageKind,
};
pub use serialization::{WireReader, WireWriter};
