//! Vertex and edge types. A vertex owns its adjacency list; back-references
//! to the partition or store are by id only.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::graph::value::{get_data, put_data, VertexId, WireData};
use crate::utils::GraphyneError;

/// A directed edge out of some vertex: target vertex id plus edge value.
/// The source is implicit in the owning vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<I, E> {
    /// Target vertex id.
    pub target: I,

    /// Edge value.
    pub value: E,
}

impl<I: VertexId, E: WireData> Edge<I, E> {
    pub fn new(target: I, value: E) -> Self {
        Edge { target, value }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        put_data(buf, &self.target);
        put_data(buf, &self.value);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        let target = get_data(buf)?;
        let value = get_data(buf)?;
        Ok(Edge { target, value })
    }
}

/// A vertex: immutable id, mutable value, adjacency list, halted flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex<I, V, E> {
    id: I,
    /// Vertex value, mutated in place during compute.
    pub value: V,
    edges: Vec<Edge<I, E>>,
    halted: bool,
}

impl<I: VertexId, V: WireData, E: WireData> Vertex<I, V, E> {
    /// Creates a fresh active vertex with no edges.
    pub fn new(id: I, value: V) -> Self {
        Vertex {
            id,
            value,
            edges: Vec::new(),
            halted: false,
        }
    }

    /// Creates a vertex with the given adjacency list.
    pub fn with_edges(id: I, value: V, edges: Vec<Edge<I, E>>) -> Self {
        Vertex {
            id,
            value,
            edges,
            halted: false,
        }
    }

    /// The vertex id. Ids never change after initialization.
    #[inline]
    pub fn id(&self) -> &I {
        &self.id
    }

    #[inline]
    pub fn edges(&self) -> &[Edge<I, E>] {
        &self.edges
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Appends an out-edge. Multi-edges to the same target are permitted.
    pub fn add_edge(&mut self, target: I, value: E) {
        self.edges.push(Edge { target, value });
    }

    /// Removes the first edge to the given target, returning its value.
    pub fn remove_edge(&mut self, target: &I) -> Option<E> {
        let pos = self.edges.iter().position(|e| &e.target == target)?;
        Some(self.edges.remove(pos).value)
    }

    /// Whether the vertex has voted to halt.
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Vote to halt; the vertex stays inactive until a message arrives.
    pub fn vote_to_halt(&mut self) {
        self.halted = true;
    }

    /// Reactivates a halted vertex (message delivery).
    pub fn wake(&mut self) {
        self.halted = false;
    }

    /// Writes the wire form used by send-vertices payloads: id blob, value
    /// blob, 4-byte edge count, then edges. Vertices in transit are active,
    /// so no halted flag travels.
    pub fn write_wire(&self, buf: &mut BytesMut) {
        put_data(buf, &self.id);
        put_data(buf, &self.value);
        buf.put_u32(self.edges.len() as u32);
        for edge in &self.edges {
            edge.encode(buf);
        }
    }

    /// Reads the wire form written by `write_wire`.
    pub fn read_wire(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        let id = get_data(buf)?;
        let value = get_data(buf)?;
        if buf.remaining() < 4 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding edge count".into(),
            ));
        }
        let num_edges = buf.get_u32() as usize;
        let mut edges = Vec::with_capacity(num_edges);
        for _ in 0..num_edges {
            edges.push(Edge::decode(buf)?);
        }
        Ok(Vertex {
            id,
            value,
            edges,
            halted: false,
        })
    }

    /// Writes the storage form used by partition serialization and
    /// checkpoints: the wire form plus a trailing halted flag.
    pub fn write(&self, buf: &mut BytesMut) {
        self.write_wire(buf);
        buf.put_u8(u8::from(self.halted));
    }

    /// Reads the storage form written by `write`.
    pub fn read_fields(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        let mut vertex = Self::read_wire(buf)?;
        if buf.remaining() < 1 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding halted flag".into(),
            ));
        }
        vertex.halted = buf.get_u8() != 0;
        Ok(vertex)
    }
}

#[cfg(test)]
mod vertex_tests {
    use super::*;

    #[test]
    fn edge_add_remove_first_match() {
        let mut v: Vertex<i32, i32, i32> = Vertex::new(1, 10);
        v.add_edge(2, 100);
        v.add_edge(3, 200);
        v.add_edge(2, 300);
        assert_eq!(v.num_edges(), 3);

        // removes the first multi-edge to 2, not both
        assert_eq!(v.remove_edge(&2), Some(100));
        assert_eq!(v.num_edges(), 2);
        assert_eq!(v.remove_edge(&2), Some(300));
        assert_eq!(v.remove_edge(&2), None);
    }

    #[test]
    fn halt_and_wake() {
        let mut v: Vertex<i32, (), ()> = Vertex::new(5, ());
        assert!(!v.is_halted());
        v.vote_to_halt();
        assert!(v.is_halted());
        v.wake();
        assert!(!v.is_halted());
    }

    #[test]
    fn storage_round_trip_keeps_halted() -> Result<(), GraphyneError> {
        let mut v: Vertex<i64, String, f64> =
            Vertex::new(9, "value".to_string());
        v.add_edge(10, 0.5);
        v.add_edge(11, 1.5);
        v.vote_to_halt();

        let mut buf = BytesMut::new();
        v.write(&mut buf);
        let mut bytes = buf.freeze();
        let back = Vertex::<i64, String, f64>::read_fields(&mut bytes)?;
        assert_eq!(back, v);
        assert!(back.is_halted());
        assert!(bytes.is_empty());
        Ok(())
    }

    #[test]
    fn wire_round_trip_is_active() -> Result<(), GraphyneError> {
        let mut v: Vertex<i32, i32, ()> = Vertex::new(3, 30);
        v.vote_to_halt();

        let mut buf = BytesMut::new();
        v.write_wire(&mut buf);
        let mut bytes = buf.freeze();
        let back = Vertex::<i32, i32, ()>::read_wire(&mut bytes)?;
        assert_eq!(back.id(), &3);
        assert!(!back.is_halted());
        Ok(())
    }
}
