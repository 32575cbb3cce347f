//! # DirectLink Error Types
//!
//! All errors that can occur while encoding, decoding or transporting
//! scene data.

use thiserror::Error;

use crate::types::EndpointAddress;

/// Errors that can occur in the DirectLink protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectLinkError {
    /// Malformed bytes: sentinel mismatch or truncated buffer.
    #[error("stream error: {0}")]
    StreamError(&'static str),

    /// The encoded protocol version is newer than this build understands.
    #[error("protocol version {found} is above the supported maximum {max}")]
    VersionMaxNotRespected {
        /// Version read from the wire.
        found: u8,
        /// Highest version this build can decode.
        max: u8,
    },

    /// The encoded protocol version is older than this build accepts.
    #[error("protocol version {found} is below the supported minimum {min}")]
    VersionMinNotRespected {
        /// Version read from the wire.
        found: u8,
        /// Lowest version this build can decode.
        min: u8,
    },

    /// A message tag that no decoder knows about.
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// No bus participant is registered under this address.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(EndpointAddress),

    /// The bus hub was dropped.
    #[error("message bus disconnected")]
    BusDisconnected,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The network thread could not be started.
    #[error("failed to spawn network thread: {0}")]
    ThreadSpawn(String),
}

/// Result type for DirectLink operations.
pub type DirectLinkResult<T> = Result<T, DirectLinkError>;
