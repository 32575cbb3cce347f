//! # Control Messages
//!
//! Every message exchanged between endpoints, and its binary encoding.
//!
//! Each message starts with a one byte [`MessageKind`] tag. Stream traffic
//! (deltas and have-lists) then carries a fixed 12 byte [`FrameHeader`].

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::{WireReader, WireWriter};
use crate::delta::{CloseDeltaArgs, OpenDeltaArgs, SetupSceneArgs};
use crate::error::{DirectLinkError, DirectLinkResult};
use crate::snapshot::ElementSnapshot;
use crate::types::{DataPointId, ElementHash, Guid, NodeId, SceneIdentifier, StreamPort};

/// Routing header of stream messages.
///
/// Total size: 12 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FrameHeader {
    /// Port of the recipient stream end.
    pub stream_port: u32,
    /// Batch (delta) or sync cycle (have-list). `0` bypasses ordering.
    pub batch_code: u32,
    /// Zero-based position within the batch.
    pub message_code: u32,
}

impl FrameHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 12;

    /// Creates a header.
    #[inline]
    #[must_use]
    pub const fn new(stream_port: StreamPort, batch_code: u32, message_code: u32) -> Self {
        Self {
            stream_port,
            batch_code,
            message_code,
        }
    }
}

/// Tag of a top level message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Broadcast: Start, Heartbeat or Stop.
    Lifecycle = 0,
    /// Point to point: asks for an `EndpointState`.
    QueryEndpointState = 1,
    /// Point to point: full list of data points.
    EndpointState = 2,
    /// Point to point: asks to open a stream.
    OpenStreamRequest = 3,
    /// Point to point: answer to `OpenStreamRequest`.
    OpenStreamAnswer = 4,
    /// Stream: source to destination.
    Delta = 5,
    /// Point to point: closes a stream.
    CloseStreamRequest = 6,
    /// Stream: destination to source.
    HaveList = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = DirectLinkError;

    fn try_from(value: u8) -> DirectLinkResult<Self> {
        Ok(match value {
            0 => Self::Lifecycle,
            1 => Self::QueryEndpointState,
            2 => Self::EndpointState,
            3 => Self::OpenStreamRequest,
            4 => Self::OpenStreamAnswer,
            5 => Self::Delta,
            6 => Self::CloseStreamRequest,
            7 => Self::HaveList,
            other => return Err(DirectLinkError::UnknownMessageKind(other)),
        })
    }
}

/// Endpoint lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleKind {
    /// The endpoint came up.
    Start = 0,
    /// Periodic liveness signal carrying the state revision.
    Heartbeat = 1,
    /// The endpoint is going away.
    Stop = 2,
}

/// Public description of a source or destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPointInfo {
    /// Process-wide id.
    pub id: DataPointId,
    /// Display name, used by auto-connect.
    pub name: String,
    /// Source (true) or destination (false).
    pub is_source: bool,
    /// Visible to remote peers.
    pub is_public: bool,
}

/// Full state of one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointStateMessage {
    /// Endpoint name.
    pub name: String,
    /// Revision this state was taken at.
    pub revision: u64,
    /// Published sources.
    pub sources: Vec<DataPointInfo>,
    /// Published destinations.
    pub destinations: Vec<DataPointInfo>,
}

/// One step of a delta conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaEvent {
    /// Scene identity announcement. Sent with batch code `0`.
    SetupScene(SetupSceneArgs),
    /// First message of a batch.
    OpenDelta(OpenDeltaArgs),
    /// One element.
    SetElement(Arc<ElementSnapshot>),
    /// Bulk removal.
    RemoveElements(Vec<NodeId>),
    /// Last message of a batch.
    CloseDelta(CloseDeltaArgs),
}

/// One step of a have-list conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaveListEvent {
    /// First message of a cycle.
    Open {
        /// Scene the list refers to.
        scene_id: SceneIdentifier,
        /// Adds to what the source already believes instead of replacing it.
        keep_previous_content: bool,
        /// Delta batch this cycle acknowledges, `0` for the initial list.
        acked_batch: u32,
    },
    /// A run of held elements.
    Elements {
        /// Node ids.
        node_ids: Vec<NodeId>,
        /// Hashes, parallel to `node_ids`.
        hashes: Vec<ElementHash>,
    },
    /// Last message of a cycle.
    Close,
}

/// Every message exchanged between endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Lifecycle broadcast.
    Lifecycle {
        /// Event.
        kind: LifecycleKind,
        /// Sender's state revision.
        revision: u64,
    },
    /// Asks the recipient for its [`EndpointStateMessage`].
    QueryEndpointState,
    /// Full state reply.
    EndpointState(EndpointStateMessage),
    /// Asks the recipient to open a stream.
    OpenStreamRequest {
        /// The requester owns the source side.
        from_source: bool,
        /// Source data point.
        source_id: DataPointId,
        /// Destination data point.
        destination_id: DataPointId,
        /// Port of the requester's stream end.
        request_port: StreamPort,
    },
    /// Reply to `OpenStreamRequest`.
    OpenStreamAnswer {
        /// Requester's port, echoed back.
        recipient_port: StreamPort,
        /// The stream was accepted.
        accepted: bool,
        /// Port of the answerer's stream end.
        opened_port: StreamPort,
    },
    /// Delta traffic.
    Delta {
        /// Routing.
        header: FrameHeader,
        /// Payload.
        event: DeltaEvent,
    },
    /// Closes a stream without waiting for confirmation.
    CloseStreamRequest {
        /// Port of the recipient stream end.
        recipient_port: StreamPort,
    },
    /// Have-list traffic.
    HaveList {
        /// Routing.
        header: FrameHeader,
        /// Payload.
        event: HaveListEvent,
    },
}

const DELTA_SETUP: u8 = 0;
const DELTA_OPEN: u8 = 1;
const DELTA_SET_ELEMENT: u8 = 2;
const DELTA_REMOVE: u8 = 3;
const DELTA_CLOSE: u8 = 4;

const HAVE_OPEN: u8 = 0;
const HAVE_ELEMENTS: u8 = 1;
const HAVE_CLOSE: u8 = 2;

impl Message {
    /// Tag of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Lifecycle { .. } => MessageKind::Lifecycle,
            Self::QueryEndpointState => MessageKind::QueryEndpointState,
            Self::EndpointState(_) => MessageKind::EndpointState,
            Self::OpenStreamRequest { .. } => MessageKind::OpenStreamRequest,
            Self::OpenStreamAnswer { .. } => MessageKind::OpenStreamAnswer,
            Self::Delta { .. } => MessageKind::Delta,
            Self::CloseStreamRequest { .. } => MessageKind::CloseStreamRequest,
            Self::HaveList { .. } => MessageKind::HaveList,
        }
    }

    /// Encodes the message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64);
        w.write_u8(self.kind() as u8);
        match self {
            Self::Lifecycle { kind, revision } => {
                w.write_u8(*kind as u8);
                w.write_u64(*revision);
            }
            Self::QueryEndpointState => {}
            Self::EndpointState(state) => {
                w.write_str(&state.name);
                w.write_u64(state.revision);
                write_data_points(&mut w, &state.sources);
                write_data_points(&mut w, &state.destinations);
            }
            Self::OpenStreamRequest {
                from_source,
                source_id,
                destination_id,
                request_port,
            } => {
                w.write_bool(*from_source);
                w.write_u128(source_id.0);
                w.write_u128(destination_id.0);
                w.write_u32(*request_port);
            }
            Self::OpenStreamAnswer {
                recipient_port,
                accepted,
                opened_port,
            } => {
                w.write_u32(*recipient_port);
                w.write_bool(*accepted);
                w.write_u32(*opened_port);
            }
            Self::Delta { header, event } => {
                w.write_pod(header);
                write_delta_event(&mut w, event);
            }
            Self::CloseStreamRequest { recipient_port } => w.write_u32(*recipient_port),
            Self::HaveList { header, event } => {
                w.write_pod(header);
                write_have_list_event(&mut w, event);
            }
        }
        w.into_bytes()
    }

    /// Decodes a buffer holding exactly one message.
    pub fn decode(bytes: &[u8]) -> DirectLinkResult<Self> {
        let mut r = WireReader::new(bytes);
        let message = match MessageKind::try_from(r.read_u8()?)? {
            MessageKind::Lifecycle => {
                let kind = match r.read_u8()? {
                    0 => LifecycleKind::Start,
                    1 => LifecycleKind::Heartbeat,
                    2 => LifecycleKind::Stop,
                    _ => return Err(DirectLinkError::StreamError("unknown lifecycle kind")),
                };
                Self::Lifecycle {
                    kind,
                    revision: r.read_u64()?,
                }
            }
            MessageKind::QueryEndpointState => Self::QueryEndpointState,
            MessageKind::EndpointState => Self::EndpointState(EndpointStateMessage {
                name: r.read_string()?,
                revision: r.read_u64()?,
                sources: read_data_points(&mut r)?,
                destinations: read_data_points(&mut r)?,
            }),
            MessageKind::OpenStreamRequest => Self::OpenStreamRequest {
                from_source: r.read_bool()?,
                source_id: Guid(r.read_u128()?),
                destination_id: Guid(r.read_u128()?),
                request_port: r.read_u32()?,
            },
            MessageKind::OpenStreamAnswer => Self::OpenStreamAnswer {
                recipient_port: r.read_u32()?,
                accepted: r.read_bool()?,
                opened_port: r.read_u32()?,
            },
            MessageKind::Delta => Self::Delta {
                header: r.read_pod()?,
                event: read_delta_event(&mut r)?,
            },
            MessageKind::CloseStreamRequest => Self::CloseStreamRequest {
                recipient_port: r.read_u32()?,
            },
            MessageKind::HaveList => Self::HaveList {
                header: r.read_pod()?,
                event: read_have_list_event(&mut r)?,
            },
        };
        if r.remaining() != 0 {
            return Err(DirectLinkError::StreamError("trailing bytes after message"));
        }
        Ok(message)
    }
}

fn write_scene_id(w: &mut WireWriter, scene_id: &SceneIdentifier) {
    w.write_u128(scene_id.guid.0);
    w.write_str(&scene_id.display_name);
}

fn read_scene_id(r: &mut WireReader<'_>) -> DirectLinkResult<SceneIdentifier> {
    Ok(SceneIdentifier {
        guid: Guid(r.read_u128()?),
        display_name: r.read_string()?,
    })
}

fn write_data_points(w: &mut WireWriter, points: &[DataPointInfo]) {
    w.write_len(points.len());
    for point in points {
        w.write_u128(point.id.0);
        w.write_str(&point.name);
        w.write_bool(point.is_source);
        w.write_bool(point.is_public);
    }
}

fn read_data_points(r: &mut WireReader<'_>) -> DirectLinkResult<Vec<DataPointInfo>> {
    let count = r.read_packed()? as usize;
    // Smallest entry: 16 byte id, 1 byte name length, 2 flags.
    if count > r.remaining() / 19 {
        return Err(DirectLinkError::StreamError("data point count exceeds buffer"));
    }
    (0..count)
        .map(|_| {
            Ok(DataPointInfo {
                id: Guid(r.read_u128()?),
                name: r.read_string()?,
                is_source: r.read_bool()?,
                is_public: r.read_bool()?,
            })
        })
        .collect()
}

fn write_ids(w: &mut WireWriter, ids: &[u32]) {
    w.write_len(ids.len());
    for id in ids {
        w.write_u32(*id);
    }
}

fn read_ids(r: &mut WireReader<'_>) -> DirectLinkResult<Vec<u32>> {
    let count = r.read_packed()? as usize;
    if count > r.remaining() / 4 {
        return Err(DirectLinkError::StreamError("id count exceeds buffer"));
    }
    (0..count).map(|_| r.read_u32()).collect()
}

fn write_delta_event(w: &mut WireWriter, event: &DeltaEvent) {
    match event {
        DeltaEvent::SetupScene(args) => {
            w.write_u8(DELTA_SETUP);
            write_scene_id(w, &args.scene_id);
            w.write_bool(args.expect_have_list);
        }
        DeltaEvent::OpenDelta(args) => {
            w.write_u8(DELTA_OPEN);
            write_scene_id(w, &args.scene_id);
            w.write_bool(args.based_on_new_scene);
            w.write_u32(args.element_count_hint);
        }
        DeltaEvent::SetElement(snapshot) => {
            w.write_u8(DELTA_SET_ELEMENT);
            snapshot.serialize(w);
        }
        DeltaEvent::RemoveElements(ids) => {
            w.write_u8(DELTA_REMOVE);
            write_ids(w, ids);
        }
        DeltaEvent::CloseDelta(args) => {
            w.write_u8(DELTA_CLOSE);
            w.write_bool(args.cancelled);
        }
    }
}

fn read_delta_event(r: &mut WireReader<'_>) -> DirectLinkResult<DeltaEvent> {
    Ok(match r.read_u8()? {
        DELTA_SETUP => DeltaEvent::SetupScene(SetupSceneArgs {
            scene_id: read_scene_id(r)?,
            expect_have_list: r.read_bool()?,
        }),
        DELTA_OPEN => DeltaEvent::OpenDelta(OpenDeltaArgs {
            scene_id: read_scene_id(r)?,
            based_on_new_scene: r.read_bool()?,
            element_count_hint: r.read_u32()?,
        }),
        DELTA_SET_ELEMENT => DeltaEvent::SetElement(Arc::new(ElementSnapshot::deserialize(r)?)),
        DELTA_REMOVE => DeltaEvent::RemoveElements(read_ids(r)?),
        DELTA_CLOSE => DeltaEvent::CloseDelta(CloseDeltaArgs {
            cancelled: r.read_bool()?,
        }),
        _ => return Err(DirectLinkError::StreamError("unknown delta kind")),
    })
}

fn write_have_list_event(w: &mut WireWriter, event: &HaveListEvent) {
    match event {
        HaveListEvent::Open {
            scene_id,
            keep_previous_content,
            acked_batch,
        } => {
            w.write_u8(HAVE_OPEN);
            write_scene_id(w, scene_id);
            w.write_bool(*keep_previous_content);
            w.write_u32(*acked_batch);
        }
        HaveListEvent::Elements { node_ids, hashes } => {
            w.write_u8(HAVE_ELEMENTS);
            write_ids(w, node_ids);
            write_ids(w, hashes);
        }
        HaveListEvent::Close => w.write_u8(HAVE_CLOSE),
    }
}

fn read_have_list_event(r: &mut WireReader<'_>) -> DirectLinkResult<HaveListEvent> {
    Ok(match r.read_u8()? {
        HAVE_OPEN => HaveListEvent::Open {
            scene_id: read_scene_id(r)?,
            keep_previous_content: r.read_bool()?,
            acked_batch: r.read_u32()?,
        },
        HAVE_ELEMENTS => {
            let node_ids = read_ids(r)?;
            let hashes = read_ids(r)?;
            if node_ids.len() != hashes.len() {
                return Err(DirectLinkError::StreamError("have-list arrays differ in length"));
            }
            HaveListEvent::Elements { node_ids, hashes }
        }
        HAVE_CLOSE => HaveListEvent::Close,
        _ => return Err(DirectLinkError::StreamError("unknown have-list kind")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ParameterStore;
    use crate::snapshot::ReferenceSnapshot;

    #[test]
    fn test_frame_header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
    }

    #[test]
    fn test_set_element_carries_snapshot() {
        let mut store = ParameterStore::new();
        store.set("name", "lamp");
        let snapshot = Arc::new(ElementSnapshot::new(4, &store, ReferenceSnapshot::default()));
        let message = Message::Delta {
            header: FrameHeader::new(9, 2, 1),
            event: DeltaEvent::SetElement(Arc::clone(&snapshot)),
        };

        let decoded = Message::decode(&message.encode()).unwrap();
        let Message::Delta { header, event: DeltaEvent::SetElement(received) } = decoded else {
            panic!("expected a SetElement delta");
        };
        assert_eq!(header, FrameHeader::new(9, 2, 1));
        assert_eq!(received.hash(), snapshot.hash());
    }

    #[test]
    fn test_endpoint_state_keeps_data_points() {
        let state = EndpointStateMessage {
            name: "editor".into(),
            revision: 12,
            sources: vec![DataPointInfo {
                id: Guid::new(),
                name: "Level".into(),
                is_source: true,
                is_public: true,
            }],
            destinations: Vec::new(),
        };
        let message = Message::EndpointState(state.clone());
        assert_eq!(Message::decode(&message.encode()).unwrap(), Message::EndpointState(state));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            Message::decode(&[0xEE]),
            Err(DirectLinkError::UnknownMessageKind(0xEE))
        );
    }

    #[test]
    fn test_mismatched_have_list_arrays_rejected() {
        let mut w = WireWriter::new();
        w.write_u8(MessageKind::HaveList as u8);
        w.write_pod(&FrameHeader::new(1, 1, 1));
        w.write_u8(HAVE_ELEMENTS);
        write_ids(&mut w, &[1, 2]);
        write_ids(&mut w, &[7]);
        assert!(matches!(
            Message::decode(w.as_slice()),
            Err(DirectLinkError::StreamError(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::QueryEndpointState.encode();
        bytes.push(0);
        assert!(Message::decode(&bytes).is_err());
    }
}
