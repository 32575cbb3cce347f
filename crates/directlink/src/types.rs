//! # Identifier Types
//!
//! Small value types shared by every layer of the protocol.

use std::fmt;

/// Identifier of a node within one scene. `0` is reserved.
pub type NodeId = u32;

/// Content hash of an element snapshot. `0` means "unknown".
pub type ElementHash = u32;

/// Local identifier of one end of a stream. `0` is reserved.
pub type StreamPort = u32;

/// Reserved "no node" id.
pub const INVALID_NODE_ID: NodeId = 0;

/// Reserved "never hashed" value.
pub const UNKNOWN_HASH: ElementHash = 0;

/// Reserved "no stream" port.
pub const INVALID_STREAM_PORT: StreamPort = 0;

/// 128-bit globally unique identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub u128);

impl Guid {
    /// The invalid, all-zero guid.
    pub const NULL: Self = Self(0);

    /// Generates a new random guid. Never returns [`Guid::NULL`].
    #[must_use]
    pub fn new() -> Self {
        loop {
            let value: u128 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Returns true unless this is the null guid.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:032x})", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identifier of a Source or a Destination.
pub type DataPointId = Guid;

/// Identifies one logical scene graph instance across processes.
///
/// A new guid means "this is not an incremental update of what you had
/// before" and forces a full resync on every peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct SceneIdentifier {
    /// Instance guid.
    pub guid: Guid,
    /// Human readable name.
    pub display_name: String,
}

impl SceneIdentifier {
    /// Creates an identifier with a fresh guid.
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            guid: Guid::new(),
            display_name: display_name.into(),
        }
    }
}

/// Address of one endpoint on the message bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EndpointAddress(pub u64);

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_is_never_null() {
        for _ in 0..64 {
            assert!(Guid::new().is_valid());
        }
        assert!(!Guid::NULL.is_valid());
    }

    #[test]
    fn test_scene_identifiers_differ() {
        let a = SceneIdentifier::new("scene");
        let b = SceneIdentifier::new("scene");
        assert_ne!(a.guid, b.guid);
        assert_eq!(a.display_name, b.display_name);
    }
}
