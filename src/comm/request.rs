//! Typed worker requests and their payload codecs. Payload layouts use
//! 4-byte count prefixes and length-prefixed id/value byte strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comm::wire::{
    Frame, TAG_ADD_EDGE, TAG_ADD_VERTEX, TAG_FLUSH, TAG_REMOVE_EDGE,
    TAG_REMOVE_VERTEX, TAG_SEND_AGGREGATORS, TAG_SEND_PARTITION_MUTATIONS,
    TAG_SEND_VERTICES, TAG_SEND_WORKER_MESSAGES,
};
use crate::comm::RequestId;
use crate::graph::{
    get_blob, get_data, get_utf, put_blob, put_data, put_utf, Edge,
    PartitionId, Vertex, VertexChanges, VertexId, WireData, WorkerId,
};
use crate::utils::GraphyneError;

/// One worker-to-worker request. Vertex-id-addressed item kinds (messages,
/// mutations) may be coalesced by the request processor into the batched
/// variants keyed by destination partition id.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest<I, V, E, M> {
    /// Vertices exchanged during the input superstep, bound for one
    /// partition on the receiving worker.
    SendVertices {
        partition: PartitionId,
        vertices: Vec<Vertex<I, V, E>>,
    },

    /// Batched per-vertex messages: per partition, per vertex, a message
    /// list.
    SendWorkerMessages {
        batches: Vec<(PartitionId, Vec<(I, Vec<M>)>)>,
    },

    /// Batched mutation changesets keyed by vertex id within one partition.
    SendPartitionMutations {
        partition: PartitionId,
        mutations: Vec<(I, VertexChanges<I, V, E>)>,
    },

    /// Aggregator partials shipped to the aggregator-owning worker:
    /// (name, kind identifier, value bytes) triples. The reserved
    /// `"<COUNT>"` name carries a 64-bit request count.
    SendAggregators {
        entries: Vec<(String, String, Vec<u8>)>,
    },

    /// Single edge addition addressed to the vertex's owner.
    AddEdge { vertex: I, edge: Edge<I, E> },

    /// Single edge removal (first match) addressed to the vertex's owner.
    RemoveEdge { vertex: I, target: I },

    /// Single vertex addition.
    AddVertex { vertex: Vertex<I, V, E> },

    /// Single vertex removal.
    RemoveVertex { vertex: I },

    /// Explicit flush point; acknowledged after everything before it.
    Flush,
}

impl<I, V, E, M> WorkerRequest<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub(crate) fn tag(&self) -> u8 {
        match self {
            WorkerRequest::SendVertices { .. } => TAG_SEND_VERTICES,
            WorkerRequest::SendWorkerMessages { .. } => {
                TAG_SEND_WORKER_MESSAGES
            }
            WorkerRequest::SendPartitionMutations { .. } => {
                TAG_SEND_PARTITION_MUTATIONS
            }
            WorkerRequest::SendAggregators { .. } => TAG_SEND_AGGREGATORS,
            WorkerRequest::AddEdge { .. } => TAG_ADD_EDGE,
            WorkerRequest::RemoveEdge { .. } => TAG_REMOVE_EDGE,
            WorkerRequest::AddVertex { .. } => TAG_ADD_VERTEX,
            WorkerRequest::RemoveVertex { .. } => TAG_REMOVE_VERTEX,
            WorkerRequest::Flush => TAG_FLUSH,
        }
    }

    /// Whether this request counts toward the per-destination request tally
    /// verified through the reserved aggregator name.
    pub(crate) fn counts_for_flow_control(&self) -> bool {
        !matches!(
            self,
            WorkerRequest::SendAggregators { .. } | WorkerRequest::Flush
        )
    }

    fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            WorkerRequest::SendVertices {
                partition,
                vertices,
            } => {
                buf.put_u32(*partition);
                buf.put_u32(vertices.len() as u32);
                for vertex in vertices {
                    vertex.write_wire(&mut buf);
                }
            }
            WorkerRequest::SendWorkerMessages { batches } => {
                buf.put_u32(batches.len() as u32);
                for (partition, vertices) in batches {
                    buf.put_u32(*partition);
                    buf.put_u32(vertices.len() as u32);
                    for (vertex, messages) in vertices {
                        put_data(&mut buf, vertex);
                        buf.put_u32(messages.len() as u32);
                        for message in messages {
                            put_data(&mut buf, message);
                        }
                    }
                }
            }
            WorkerRequest::SendPartitionMutations {
                partition,
                mutations,
            } => {
                buf.put_u32(*partition);
                buf.put_u32(mutations.len() as u32);
                for (vertex, changes) in mutations {
                    put_data(&mut buf, vertex);
                    changes.encode(&mut buf);
                }
            }
            WorkerRequest::SendAggregators { entries } => {
                buf.put_u32(entries.len() as u32);
                for (name, kind, value) in entries {
                    put_utf(&mut buf, name);
                    put_utf(&mut buf, kind);
                    put_blob(&mut buf, value);
                }
            }
            WorkerRequest::AddEdge { vertex, edge } => {
                put_data(&mut buf, vertex);
                edge.encode(&mut buf);
            }
            WorkerRequest::RemoveEdge { vertex, target } => {
                put_data(&mut buf, vertex);
                put_data(&mut buf, target);
            }
            WorkerRequest::AddVertex { vertex } => {
                vertex.write_wire(&mut buf);
            }
            WorkerRequest::RemoveVertex { vertex } => {
                put_data(&mut buf, vertex);
            }
            WorkerRequest::Flush => {}
        }
        buf.freeze()
    }

    /// Encodes into a full frame.
    pub(crate) fn into_frame(
        self,
        request_id: RequestId,
        source: WorkerId,
    ) -> Frame {
        Frame::new(self.tag(), request_id, source, self.encode_payload())
    }

    /// Decodes a request out of a received frame.
    pub(crate) fn from_frame(frame: &Frame) -> Result<Self, GraphyneError> {
        let mut buf = frame.payload.clone();
        let request = match frame.tag {
            TAG_SEND_VERTICES => {
                let (partition, count) = get_header(&mut buf)?;
                let mut vertices = Vec::with_capacity(count);
                for _ in 0..count {
                    vertices.push(Vertex::read_wire(&mut buf)?);
                }
                WorkerRequest::SendVertices {
                    partition,
                    vertices,
                }
            }
            TAG_SEND_WORKER_MESSAGES => {
                let num_batches = get_count(&mut buf)?;
                let mut batches = Vec::with_capacity(num_batches);
                for _ in 0..num_batches {
                    let (partition, num_vertices) = get_header(&mut buf)?;
                    let mut vertices = Vec::with_capacity(num_vertices);
                    for _ in 0..num_vertices {
                        let vertex = get_data(&mut buf)?;
                        let num_messages = get_count(&mut buf)?;
                        let mut messages = Vec::with_capacity(num_messages);
                        for _ in 0..num_messages {
                            messages.push(get_data(&mut buf)?);
                        }
                        vertices.push((vertex, messages));
                    }
                    batches.push((partition, vertices));
                }
                WorkerRequest::SendWorkerMessages { batches }
            }
            TAG_SEND_PARTITION_MUTATIONS => {
                let (partition, count) = get_header(&mut buf)?;
                let mut mutations = Vec::with_capacity(count);
                for _ in 0..count {
                    let vertex = get_data(&mut buf)?;
                    let changes = VertexChanges::decode(&mut buf)?;
                    mutations.push((vertex, changes));
                }
                WorkerRequest::SendPartitionMutations {
                    partition,
                    mutations,
                }
            }
            TAG_SEND_AGGREGATORS => {
                let count = get_count(&mut buf)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = get_utf(&mut buf)?;
                    let kind = get_utf(&mut buf)?;
                    let value = get_blob(&mut buf)?.to_vec();
                    entries.push((name, kind, value));
                }
                WorkerRequest::SendAggregators { entries }
            }
            TAG_ADD_EDGE => {
                let vertex = get_data(&mut buf)?;
                let edge = Edge::decode(&mut buf)?;
                WorkerRequest::AddEdge { vertex, edge }
            }
            TAG_REMOVE_EDGE => {
                let vertex = get_data(&mut buf)?;
                let target = get_data(&mut buf)?;
                WorkerRequest::RemoveEdge { vertex, target }
            }
            TAG_ADD_VERTEX => WorkerRequest::AddVertex {
                vertex: Vertex::read_wire(&mut buf)?,
            },
            TAG_REMOVE_VERTEX => WorkerRequest::RemoveVertex {
                vertex: get_data(&mut buf)?,
            },
            TAG_FLUSH => WorkerRequest::Flush,
            tag => {
                return Err(GraphyneError::ProtocolViolation(format!(
                    "unknown request type tag {:#04x}",
                    tag
                )));
            }
        };
        Ok(request)
    }
}

fn get_count(buf: &mut Bytes) -> Result<usize, GraphyneError> {
    if buf.remaining() < 4 {
        return Err(GraphyneError::Deserialization(
            "short buffer decoding count".into(),
        ));
    }
    Ok(buf.get_u32() as usize)
}

fn get_header(
    buf: &mut Bytes,
) -> Result<(PartitionId, usize), GraphyneError> {
    if buf.remaining() < 8 {
        return Err(GraphyneError::Deserialization(
            "short buffer decoding partition header".into(),
        ));
    }
    Ok((buf.get_u32(), buf.get_u32() as usize))
}

#[cfg(test)]
mod request_tests {
    use super::*;

    type IntRequest = WorkerRequest<i32, i32, i32, i32>;

    fn round_trip(request: IntRequest) -> IntRequest {
        let frame = request.into_frame(9, 1);
        WorkerRequest::from_frame(&frame).unwrap()
    }

    #[test]
    fn send_vertices_round_trip() {
        let vertices = (0..10).map(|i| Vertex::new(i, i)).collect::<Vec<_>>();
        let back = round_trip(IntRequest::SendVertices {
            partition: 13,
            vertices: vertices.clone(),
        });
        match back {
            IntRequest::SendVertices {
                partition,
                vertices: got,
            } => {
                assert_eq!(partition, 13);
                assert_eq!(got, vertices);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn send_worker_messages_round_trip() {
        let mut vertices = Vec::new();
        for i in 1..7 {
            vertices.push((i, (0..i).collect::<Vec<i32>>()));
        }
        let back = round_trip(IntRequest::SendWorkerMessages {
            batches: vec![(0, vertices.clone())],
        });
        match back {
            IntRequest::SendWorkerMessages { batches } => {
                assert_eq!(batches, vec![(0, vertices)]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn mutations_round_trip() {
        let mut changes: VertexChanges<i32, i32, i32> = VertexChanges::new();
        changes.add_vertex(Vertex::new(4, 44));
        changes.remove_edge(5);
        let back = round_trip(IntRequest::SendPartitionMutations {
            partition: 19,
            mutations: vec![(4, changes)],
        });
        match back {
            IntRequest::SendPartitionMutations {
                partition,
                mutations,
            } => {
                assert_eq!(partition, 19);
                assert_eq!(mutations.len(), 1);
                assert_eq!(mutations[0].1.added_vertices().len(), 1);
                assert_eq!(mutations[0].1.removed_edges(), &[5]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn aggregators_round_trip() {
        let entries = vec![
            ("sum".to_string(), "sum_i64".to_string(), vec![1, 2, 3]),
            ("<COUNT>".to_string(), "count_u64".to_string(), vec![9; 8]),
        ];
        let back = round_trip(IntRequest::SendAggregators {
            entries: entries.clone(),
        });
        assert_eq!(back, IntRequest::SendAggregators { entries });
    }

    #[test]
    fn unknown_tag_is_protocol_violation() {
        let frame = Frame::new(0x7f, 1, 0, Bytes::new());
        let res = IntRequest::from_frame(&frame);
        assert!(matches!(
            res,
            Err(GraphyneError::ProtocolViolation(_))
        ));
    }
}
