//! Partition: an ordered collection of vertices owned by exactly one worker
//! within a superstep. Two concrete layouts share one capability set
//! (iterate, put, lookup, serialize), chosen by configuration.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::graph::value::{VertexId, WireData};
use crate::graph::vertex::Vertex;
use crate::graph::PartitionId;
use crate::utils::GraphyneError;

/// Physical partition representation, chosen by configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum PartitionLayout {
    /// Direct object map: ordered map id -> `Vertex`.
    #[default]
    VertexMap,

    /// Serialized form: per-vertex byte strings, for memory efficiency and
    /// fast transfer/spill.
    ByteArray,
}

enum PartitionData<I, V, E> {
    VertexMap {
        vertices: BTreeMap<I, Vertex<I, V, E>>,
    },
    ByteArray {
        // encoded storage-form bytes plus cached per-vertex edge count
        vertices: BTreeMap<I, (Vec<u8>, u32)>,
    },
}

impl<I: Clone + Ord, V: Clone, E: Clone> Clone for PartitionData<I, V, E> {
    fn clone(&self) -> Self {
        match self {
            PartitionData::VertexMap { vertices } => PartitionData::VertexMap {
                vertices: vertices.clone(),
            },
            PartitionData::ByteArray { vertices } => PartitionData::ByteArray {
                vertices: vertices.clone(),
            },
        }
    }
}

/// A partition of the graph. The id never changes; cached counts equal the
/// derived counts of the underlying map after any mutation.
pub struct Partition<I, V, E> {
    id: PartitionId,
    data: PartitionData<I, V, E>,
    edge_count: u64,
}

impl<I: Clone + Ord, V: Clone, E: Clone> Clone for Partition<I, V, E> {
    fn clone(&self) -> Self {
        Partition {
            id: self.id,
            data: self.data.clone(),
            edge_count: self.edge_count,
        }
    }
}

impl<I: VertexId, V: WireData, E: WireData> Partition<I, V, E> {
    /// Creates an empty partition with the given layout.
    pub fn new(id: PartitionId, layout: PartitionLayout) -> Self {
        let data = match layout {
            PartitionLayout::VertexMap => PartitionData::VertexMap {
                vertices: BTreeMap::new(),
            },
            PartitionLayout::ByteArray => PartitionData::ByteArray {
                vertices: BTreeMap::new(),
            },
        };
        Partition {
            id,
            data,
            edge_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn layout(&self) -> PartitionLayout {
        match self.data {
            PartitionData::VertexMap { .. } => PartitionLayout::VertexMap,
            PartitionData::ByteArray { .. } => PartitionLayout::ByteArray,
        }
    }

    pub fn vertex_count(&self) -> u64 {
        match &self.data {
            PartitionData::VertexMap { vertices } => vertices.len() as u64,
            PartitionData::ByteArray { vertices } => vertices.len() as u64,
        }
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count
    }

    /// Inserts a vertex, replacing any existing vertex with the same id
    /// (last write wins).
    pub fn put_vertex(&mut self, vertex: Vertex<I, V, E>) {
        let new_edges = vertex.num_edges() as u64;
        match &mut self.data {
            PartitionData::VertexMap { vertices } => {
                if let Some(old) =
                    vertices.insert(vertex.id().clone(), vertex)
                {
                    self.edge_count -= old.num_edges() as u64;
                }
            }
            PartitionData::ByteArray { vertices } => {
                let mut buf = BytesMut::new();
                vertex.write(&mut buf);
                let entry = (buf.to_vec(), vertex.num_edges() as u32);
                if let Some((_, old_edges)) =
                    vertices.insert(vertex.id().clone(), entry)
                {
                    self.edge_count -= old_edges as u64;
                }
            }
        }
        self.edge_count += new_edges;
    }

    pub fn has_vertex(&self, id: &I) -> bool {
        match &self.data {
            PartitionData::VertexMap { vertices } => vertices.contains_key(id),
            PartitionData::ByteArray { vertices } => vertices.contains_key(id),
        }
    }

    /// Looks up a vertex by id, decoding it out of the byte layout.
    pub fn get_vertex(&self, id: &I) -> Option<Vertex<I, V, E>> {
        match &self.data {
            PartitionData::VertexMap { vertices } => vertices.get(id).cloned(),
            PartitionData::ByteArray { vertices } => {
                let (bytes, _) = vertices.get(id)?;
                let mut buf = Bytes::copy_from_slice(bytes);
                Vertex::read_fields(&mut buf).ok()
            }
        }
    }

    /// Detaches and returns a vertex.
    pub fn take_vertex(&mut self, id: &I) -> Option<Vertex<I, V, E>> {
        match &mut self.data {
            PartitionData::VertexMap { vertices } => {
                let vertex = vertices.remove(id)?;
                self.edge_count -= vertex.num_edges() as u64;
                Some(vertex)
            }
            PartitionData::ByteArray { vertices } => {
                let (bytes, edges) = vertices.remove(id)?;
                self.edge_count -= edges as u64;
                let mut buf = Bytes::from(bytes);
                Vertex::read_fields(&mut buf).ok()
            }
        }
    }

    /// Vertex ids in ascending order (stable within a superstep).
    pub fn vertex_ids(&self) -> Vec<I> {
        match &self.data {
            PartitionData::VertexMap { vertices } => {
                vertices.keys().cloned().collect()
            }
            PartitionData::ByteArray { vertices } => {
                vertices.keys().cloned().collect()
            }
        }
    }

    /// Read-only pass over all vertices in id order.
    pub fn for_each_vertex<F>(&self, mut f: F) -> Result<(), GraphyneError>
    where
        F: FnMut(&Vertex<I, V, E>),
    {
        match &self.data {
            PartitionData::VertexMap { vertices } => {
                for vertex in vertices.values() {
                    f(vertex);
                }
            }
            PartitionData::ByteArray { vertices } => {
                for (bytes, _) in vertices.values() {
                    let mut buf = Bytes::copy_from_slice(bytes);
                    f(&Vertex::read_fields(&mut buf)?);
                }
            }
        }
        Ok(())
    }

    /// Mutating pass over all vertices in id order. On the byte layout the
    /// vertex is decoded, updated, and written back in place.
    pub fn update_vertices<F>(&mut self, mut f: F) -> Result<(), GraphyneError>
    where
        F: FnMut(&mut Vertex<I, V, E>),
    {
        match &mut self.data {
            PartitionData::VertexMap { vertices } => {
                let mut edge_count = 0u64;
                for vertex in vertices.values_mut() {
                    f(vertex);
                    edge_count += vertex.num_edges() as u64;
                }
                self.edge_count = edge_count;
            }
            PartitionData::ByteArray { vertices } => {
                let mut edge_count = 0u64;
                for entry in vertices.values_mut() {
                    let mut buf = Bytes::copy_from_slice(&entry.0);
                    let mut vertex = Vertex::read_fields(&mut buf)?;
                    f(&mut vertex);
                    let mut out = BytesMut::new();
                    vertex.write(&mut out);
                    *entry = (out.to_vec(), vertex.num_edges() as u32);
                    edge_count += vertex.num_edges() as u64;
                }
                self.edge_count = edge_count;
            }
        }
        Ok(())
    }

    /// Folds another partition's vertices into this one. Conflicting vertex
    /// ids keep the most recently inserted vertex.
    pub fn merge(&mut self, other: Partition<I, V, E>) {
        for vertex in other.into_vertices() {
            self.put_vertex(vertex);
        }
    }

    /// Consumes the partition, yielding its vertices in id order. Vertices
    /// that fail to decode off the byte layout have been validated on entry,
    /// so the decode here is infallible in practice.
    pub fn into_vertices(self) -> Vec<Vertex<I, V, E>> {
        match self.data {
            PartitionData::VertexMap { vertices } => {
                vertices.into_values().collect()
            }
            PartitionData::ByteArray { vertices } => vertices
                .into_values()
                .filter_map(|(bytes, _)| {
                    let mut buf = Bytes::from(bytes);
                    Vertex::read_fields(&mut buf).ok()
                })
                .collect(),
        }
    }

    /// Serializes the partition: 4-byte id, 4-byte vertex count, then each
    /// vertex in storage form.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), GraphyneError> {
        buf.put_u32(self.id);
        buf.put_u32(self.vertex_count() as u32);
        match &self.data {
            PartitionData::VertexMap { vertices } => {
                for vertex in vertices.values() {
                    vertex.write(buf);
                }
            }
            PartitionData::ByteArray { vertices } => {
                for (bytes, _) in vertices.values() {
                    buf.put_slice(bytes);
                }
            }
        }
        Ok(())
    }

    /// Deserializes a partition written by `write` into the given layout.
    pub fn read_fields(
        buf: &mut Bytes,
        layout: PartitionLayout,
    ) -> Result<Self, GraphyneError> {
        if buf.remaining() < 8 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding partition header".into(),
            ));
        }
        let id = buf.get_u32();
        let vertex_count = buf.get_u32();
        let mut partition = Partition::new(id, layout);
        for _ in 0..vertex_count {
            partition.put_vertex(Vertex::read_fields(buf)?);
        }
        Ok(partition)
    }
}

#[cfg(test)]
mod partition_tests {
    use super::*;

    fn int_vertex(id: i32) -> Vertex<i32, i32, ()> {
        Vertex::new(id, id)
    }

    #[test]
    fn counts_track_mutations() {
        let mut partition: Partition<i32, i32, ()> =
            Partition::new(5, PartitionLayout::VertexMap);
        let mut v = int_vertex(1);
        v.add_edge(2, ());
        v.add_edge(3, ());
        partition.put_vertex(v);
        partition.put_vertex(int_vertex(2));
        assert_eq!(partition.vertex_count(), 2);
        assert_eq!(partition.edge_count(), 2);

        // replacing vertex 1 drops its two edges
        partition.put_vertex(int_vertex(1));
        assert_eq!(partition.vertex_count(), 2);
        assert_eq!(partition.edge_count(), 0);

        assert!(partition.take_vertex(&2).is_some());
        assert_eq!(partition.vertex_count(), 1);
    }

    #[test]
    fn byte_array_round_trip() -> Result<(), GraphyneError> {
        // seven vertices with ids 1..=7 and no edges into partition 3
        let mut partition: Partition<i32, i32, ()> =
            Partition::new(3, PartitionLayout::ByteArray);
        for i in 1..=7 {
            partition.put_vertex(int_vertex(i));
        }
        assert_eq!(partition.id(), 3);
        assert_eq!(partition.vertex_count(), 7);
        assert_eq!(partition.edge_count(), 0);

        let mut buf = BytesMut::new();
        partition.write(&mut buf)?;
        let mut bytes = buf.freeze();
        let back: Partition<i32, i32, ()> =
            Partition::read_fields(&mut bytes, PartitionLayout::ByteArray)?;

        assert_eq!(back.id(), 3);
        assert_eq!(back.vertex_count(), 7);
        assert_eq!(back.edge_count(), 0);
        for i in 1..=7 {
            assert_eq!(back.get_vertex(&i).unwrap().value, i);
        }
        Ok(())
    }

    #[test]
    fn layouts_agree_on_round_trip() -> Result<(), GraphyneError> {
        let mut partition: Partition<i64, String, f64> =
            Partition::new(0, PartitionLayout::VertexMap);
        let mut v = Vertex::new(10, "ten".to_string());
        v.add_edge(11, 0.5);
        partition.put_vertex(v);
        partition.put_vertex(Vertex::new(11, "eleven".to_string()));

        let mut buf = BytesMut::new();
        partition.write(&mut buf)?;
        let mut bytes = buf.freeze();
        let back: Partition<i64, String, f64> =
            Partition::read_fields(&mut bytes, PartitionLayout::ByteArray)?;

        assert_eq!(back.vertex_count(), 2);
        assert_eq!(back.edge_count(), 1);
        let tuples: Vec<_> = back
            .into_vertices()
            .into_iter()
            .map(|v| (*v.id(), v.value.clone(), v.num_edges()))
            .collect();
        assert_eq!(
            tuples,
            vec![(10, "ten".to_string(), 1), (11, "eleven".to_string(), 0)]
        );
        Ok(())
    }

    #[test]
    fn merge_is_last_write_wins() {
        let mut a: Partition<i32, i32, ()> =
            Partition::new(1, PartitionLayout::VertexMap);
        a.put_vertex(Vertex::new(1, 100));
        a.put_vertex(Vertex::new(2, 200));

        let mut b: Partition<i32, i32, ()> =
            Partition::new(1, PartitionLayout::VertexMap);
        b.put_vertex(Vertex::new(2, 999));
        b.put_vertex(Vertex::new(3, 300));

        a.merge(b);
        assert_eq!(a.vertex_count(), 3);
        assert_eq!(a.get_vertex(&2).unwrap().value, 999);
    }
}
