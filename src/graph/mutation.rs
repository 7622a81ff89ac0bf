//! Per-vertex mutation changeset, buffered between supersteps and drained
//! exactly once by the vertex resolver.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::graph::value::{get_data, put_data, VertexId, WireData};
use crate::graph::vertex::{Edge, Vertex};
use crate::utils::GraphyneError;

/// Buffered add/remove requests targeting one vertex id.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexChanges<I, V, E> {
    added_vertices: Vec<Vertex<I, V, E>>,
    removed_vertex_count: u32,
    added_edges: Vec<Edge<I, E>>,
    removed_edges: Vec<I>,
}

impl<I, V, E> Default for VertexChanges<I, V, E> {
    fn default() -> Self {
        VertexChanges {
            added_vertices: Vec::new(),
            removed_vertex_count: 0,
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
        }
    }
}

impl<I: VertexId, V: WireData, E: WireData> VertexChanges<I, V, E> {
    pub fn new() -> Self {
        VertexChanges {
            added_vertices: Vec::new(),
            removed_vertex_count: 0,
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
        }
    }

    pub fn add_vertex(&mut self, vertex: Vertex<I, V, E>) {
        self.added_vertices.push(vertex);
    }

    pub fn remove_vertex(&mut self) {
        self.removed_vertex_count += 1;
    }

    pub fn add_edge(&mut self, edge: Edge<I, E>) {
        self.added_edges.push(edge);
    }

    pub fn remove_edge(&mut self, target: I) {
        self.removed_edges.push(target);
    }

    pub fn added_vertices(&self) -> &[Vertex<I, V, E>] {
        &self.added_vertices
    }

    pub fn removed_vertex_count(&self) -> u32 {
        self.removed_vertex_count
    }

    pub fn added_edges(&self) -> &[Edge<I, E>] {
        &self.added_edges
    }

    pub fn removed_edges(&self) -> &[I] {
        &self.removed_edges
    }

    pub fn is_empty(&self) -> bool {
        self.added_vertices.is_empty()
            && self.removed_vertex_count == 0
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }

    /// Folds another changeset targeting the same vertex id into this one,
    /// preserving arrival order within each request kind.
    pub fn merge(&mut self, other: VertexChanges<I, V, E>) {
        self.added_vertices.extend(other.added_vertices);
        self.removed_vertex_count += other.removed_vertex_count;
        self.added_edges.extend(other.added_edges);
        self.removed_edges.extend(other.removed_edges);
    }

    /// Decomposes the changeset for resolution.
    pub fn into_parts(
        self,
    ) -> (Vec<Vertex<I, V, E>>, u32, Vec<Edge<I, E>>, Vec<I>) {
        (
            self.added_vertices,
            self.removed_vertex_count,
            self.added_edges,
            self.removed_edges,
        )
    }

    /// Wire form: 4-byte counts prefix each list; vertex entries travel in
    /// wire form, ids and edge parts as length-prefixed byte strings.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.added_vertices.len() as u32);
        for vertex in &self.added_vertices {
            vertex.write_wire(buf);
        }
        buf.put_u32(self.removed_vertex_count);
        buf.put_u32(self.added_edges.len() as u32);
        for edge in &self.added_edges {
            edge.encode(buf);
        }
        buf.put_u32(self.removed_edges.len() as u32);
        for target in &self.removed_edges {
            put_data(buf, target);
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        if buf.remaining() < 4 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding changeset".into(),
            ));
        }
        let num_vertices = buf.get_u32() as usize;
        let mut added_vertices = Vec::with_capacity(num_vertices);
        for _ in 0..num_vertices {
            added_vertices.push(Vertex::read_wire(buf)?);
        }
        if buf.remaining() < 8 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding changeset counts".into(),
            ));
        }
        let removed_vertex_count = buf.get_u32();
        let num_edges = buf.get_u32() as usize;
        let mut added_edges = Vec::with_capacity(num_edges);
        for _ in 0..num_edges {
            added_edges.push(Edge::decode(buf)?);
        }
        if buf.remaining() < 4 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding removed edge count".into(),
            ));
        }
        let num_removed = buf.get_u32() as usize;
        let mut removed_edges = Vec::with_capacity(num_removed);
        for _ in 0..num_removed {
            removed_edges.push(get_data(buf)?);
        }
        Ok(VertexChanges {
            added_vertices,
            removed_vertex_count,
            added_edges,
            removed_edges,
        })
    }
}
