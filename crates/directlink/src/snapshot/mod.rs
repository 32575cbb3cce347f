//! # Element Snapshots
//!
//! Immutable capture of one node's attributes and references, independent
//! of later mutation of the live node.
//!
//! ## Wire Format
//!
//! ```text
//! ┌───────┬─────────┬──────────┬────────────────┬───────┬──────────────────┬───────┐
//! │ 0xD1  │ version │ node id  │ data blob      │ 0xD1  │ reference groups │ 0xD1  │
//! │ 1 B   │ 1 B     │ u32 LE   │ packed len + … │ 1 B   │ packed count + … │ 1 B   │
//! └───────┴─────────┴──────────┴────────────────┴───────┴──────────────────┴───────┘
//! ```
//!
//! Each reference group is a packed-length name followed by a packed count
//! and that many `u32 LE` node ids.
//!
//! ## Hashing
//!
//! `hash = data_hash ^ ref_hash`, both CRC32, computed on first use and
//! cached for the life of the snapshot.

use std::sync::OnceLock;

use crate::error::{DirectLinkError, DirectLinkResult};
use crate::protocol::{WireReader, WireWriter};
use crate::scene::{ParameterStore, SceneNode};
use crate::types::{ElementHash, NodeId};
use crate::{MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// Sentinel byte framing a serialized snapshot.
pub const SNAPSHOT_MAGIC: u8 = 0xD1;

/// One named group of referenced node ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceGroup {
    /// Group name.
    pub name: String,
    /// Referenced ids, in the node's order.
    pub referenced_ids: Vec<NodeId>,
}

/// Ordered list of reference groups of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceSnapshot {
    /// Groups in declaration order.
    pub groups: Vec<ReferenceGroup>,
}

impl ReferenceSnapshot {
    /// Running CRC32 over every group, in order.
    #[must_use]
    pub fn hash(&self) -> ElementHash {
        if self.groups.is_empty() {
            return 0;
        }
        let mut hasher = crc32fast::Hasher::new();
        for group in &self.groups {
            hasher.update(group.name.as_bytes());
            hasher.update(&u32::try_from(group.referenced_ids.len()).unwrap_or(u32::MAX).to_le_bytes());
            for id in &group.referenced_ids {
                hasher.update(&id.to_le_bytes());
            }
        }
        hasher.finalize()
    }

    /// Every referenced id, across groups.
    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.groups.iter().flat_map(|g| g.referenced_ids.iter().copied())
    }
}

/// Frozen state of one node.
#[derive(Clone, Debug)]
pub struct ElementSnapshot {
    node_id: NodeId,
    data: Vec<u8>,
    references: ReferenceSnapshot,
    data_hash: OnceLock<ElementHash>,
    ref_hash: OnceLock<ElementHash>,
}

impl ElementSnapshot {
    /// Builds a snapshot from already extracted parts.
    #[must_use]
    pub fn new(node_id: NodeId, store: &ParameterStore, references: ReferenceSnapshot) -> Self {
        Self::from_parts(node_id, store.to_blob(), references)
    }

    fn from_parts(node_id: NodeId, data: Vec<u8>, references: ReferenceSnapshot) -> Self {
        Self {
            node_id,
            data,
            references,
            data_hash: OnceLock::new(),
            ref_hash: OnceLock::new(),
        }
    }

    /// Captures the current state of a live node.
    #[must_use]
    pub fn capture(node: &dyn SceneNode) -> Self {
        let groups = (0..node.reference_proxy_count())
            .filter_map(|i| node.reference_proxy(i))
            .map(|proxy| ReferenceGroup {
                name: proxy.name().to_owned(),
                referenced_ids: (0..proxy.num())
                    .filter_map(|j| proxy.node(j))
                    .map(|n| n.node_id())
                    .collect(),
            })
            .collect();
        Self::new(node.node_id(), &node.store(), ReferenceSnapshot { groups })
    }

    /// Id of the captured node.
    #[inline]
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Opaque parameter blob.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the parameter blob.
    pub fn parameters(&self) -> DirectLinkResult<ParameterStore> {
        ParameterStore::from_blob(&self.data)
    }

    /// Reference groups.
    #[must_use]
    pub const fn references(&self) -> &ReferenceSnapshot {
        &self.references
    }

    /// CRC32 of the parameter blob.
    pub fn data_hash(&self) -> ElementHash {
        *self.data_hash.get_or_init(|| crc32fast::hash(&self.data))
    }

    /// CRC32 of the reference groups.
    pub fn ref_hash(&self) -> ElementHash {
        *self.ref_hash.get_or_init(|| self.references.hash())
    }

    /// Content hash: `data_hash ^ ref_hash`.
    pub fn hash(&self) -> ElementHash {
        self.data_hash() ^ self.ref_hash()
    }

    /// Appends the wire form of this snapshot.
    pub fn serialize(&self, writer: &mut WireWriter) {
        writer.write_u8(SNAPSHOT_MAGIC);
        writer.write_u8(PROTOCOL_VERSION);
        writer.write_u32(self.node_id);
        writer.write_bytes(&self.data);
        writer.write_u8(SNAPSHOT_MAGIC);
        writer.write_len(self.references.groups.len());
        for group in &self.references.groups {
            writer.write_str(&group.name);
            writer.write_len(group.referenced_ids.len());
            for id in &group.referenced_ids {
                writer.write_u32(*id);
            }
        }
        writer.write_u8(SNAPSHOT_MAGIC);
    }

    /// Wire form of this snapshot.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(self.data.len() + 32);
        self.serialize(&mut writer);
        writer.into_bytes()
    }

    /// Reads one snapshot from the wire.
    pub fn deserialize(reader: &mut WireReader<'_>) -> DirectLinkResult<Self> {
        reader.expect_u8(SNAPSHOT_MAGIC, "bad snapshot header magic")?;
        let version = reader.read_u8()?;
        if version > PROTOCOL_VERSION {
            return Err(DirectLinkError::VersionMaxNotRespected {
                found: version,
                max: PROTOCOL_VERSION,
            });
        }
        if version < MIN_SUPPORTED_PROTOCOL_VERSION {
            return Err(DirectLinkError::VersionMinNotRespected {
                found: version,
                min: MIN_SUPPORTED_PROTOCOL_VERSION,
            });
        }
        let node_id = reader.read_u32()?;
        let data = reader.read_bytes()?.to_vec();
        reader.expect_u8(SNAPSHOT_MAGIC, "bad snapshot data sentinel")?;

        let group_count = reader.read_packed()?;
        let mut groups = Vec::new();
        for _ in 0..group_count {
            let name = reader.read_string()?;
            let count = reader.read_packed()? as usize;
            // Each id takes 4 bytes; refuse counts the buffer cannot hold.
            if count > reader.remaining() / 4 {
                return Err(DirectLinkError::StreamError("reference count exceeds buffer"));
            }
            let referenced_ids = (0..count)
                .map(|_| reader.read_u32())
                .collect::<DirectLinkResult<Vec<_>>>()?;
            groups.push(ReferenceGroup {
                name,
                referenced_ids,
            });
        }
        reader.expect_u8(SNAPSHOT_MAGIC, "bad snapshot trailer magic")?;

        Ok(Self::from_parts(node_id, data, ReferenceSnapshot { groups }))
    }

    /// Decodes a buffer holding exactly one snapshot.
    pub fn from_bytes(bytes: &[u8]) -> DirectLinkResult<Self> {
        let mut reader = WireReader::new(bytes);
        let snapshot = Self::deserialize(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(DirectLinkError::StreamError("trailing bytes after snapshot"));
        }
        Ok(snapshot)
    }
}

impl PartialEq for ElementSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.data == other.data
            && self.references == other.references
    }
}

impl Eq for ElementSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::MemoryScene;

    fn sample() -> ElementSnapshot {
        let mut store = ParameterStore::new();
        store.set("name", "chair");
        store.set("height", 0.9_f64);
        ElementSnapshot::new(
            7,
            &store,
            ReferenceSnapshot {
                groups: vec![
                    ReferenceGroup {
                        name: "children".into(),
                        referenced_ids: vec![3, 1, 2],
                    },
                    ReferenceGroup {
                        name: "material".into(),
                        referenced_ids: vec![9],
                    },
                ],
            },
        )
    }

    #[test]
    fn test_round_trip_keeps_hash_and_groups() {
        let original = sample();
        let decoded = ElementSnapshot::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.hash(), original.hash());
        assert_eq!(decoded.node_id(), 7);
        assert_eq!(decoded.references().groups[0].referenced_ids, vec![3, 1, 2]);
        assert_eq!(decoded.references().groups[1].name, "material");
    }

    #[test]
    fn test_hash_is_stable_across_captures() {
        let mut scene = MemoryScene::new("scene");
        let root = scene.create_node("root");
        let child = scene.create_node("child");
        root.add_reference("children", &child);

        let first = ElementSnapshot::capture(root.as_ref());
        let second = ElementSnapshot::capture(root.as_ref());
        assert_eq!(first.hash(), second.hash());
        assert_ne!(first.hash(), 0);
    }

    #[test]
    fn test_reference_order_changes_hash() {
        let a = ReferenceSnapshot {
            groups: vec![ReferenceGroup {
                name: "g".into(),
                referenced_ids: vec![1, 2],
            }],
        };
        let b = ReferenceSnapshot {
            groups: vec![ReferenceGroup {
                name: "g".into(),
                referenced_ids: vec![2, 1],
            }],
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_data_change_changes_only_data_hash() {
        let original = sample();
        let mut store = original.parameters().unwrap();
        store.set("height", 1.2_f64);
        let modified = ElementSnapshot::new(7, &store, original.references().clone());
        assert_ne!(modified.data_hash(), original.data_hash());
        assert_eq!(modified.ref_hash(), original.ref_hash());
        assert_ne!(modified.hash(), original.hash());
    }

    #[test]
    fn test_bad_magic_is_stream_error() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 0x00;
        assert!(matches!(
            ElementSnapshot::from_bytes(&bytes),
            Err(DirectLinkError::StreamError(_))
        ));

        let mut bytes = sample().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = 0x42;
        assert!(matches!(
            ElementSnapshot::from_bytes(&bytes),
            Err(DirectLinkError::StreamError(_))
        ));
    }

    #[test]
    fn test_version_outside_range_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[1] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            ElementSnapshot::from_bytes(&bytes),
            Err(DirectLinkError::VersionMaxNotRespected { .. })
        ));

        bytes[1] = MIN_SUPPORTED_PROTOCOL_VERSION - 1;
        assert!(matches!(
            ElementSnapshot::from_bytes(&bytes),
            Err(DirectLinkError::VersionMinNotRespected { .. })
        ));
    }

    #[test]
    fn test_truncated_snapshot_rejected() {
        let bytes = sample().to_bytes();
        for len in 0..bytes.len() {
            assert!(ElementSnapshot::from_bytes(&bytes[..len]).is_err());
        }
    }
}
