//! Server-side data bundle: everything a request handler executes against.
//! Handlers run concurrently from the request server's servant tasks and
//! synchronize on the targeted partition/vertex internally.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::comm::WorkerRequest;
use crate::graph::{
    AggregatorCatalog, Partition, PartitionId, PartitionLayout, TypeSuite,
    Vertex, VertexChanges, VertexId, VertexResolver, WireData, WorkerId,
};
use crate::utils::GraphyneError;
use crate::worker::aggregator::AggregatorServerData;
use crate::worker::message_store::MessageStore;
use crate::worker::partition_store::PartitionStore;

/// One worker's server-side state: partition store, message inboxes,
/// mutation buffer, and incoming aggregator data.
pub struct ServerData<I, V, E, M> {
    layout: PartitionLayout,

    pub partition_store: PartitionStore<I, V, E>,
    pub message_store: MessageStore<I, M>,

    /// Buffered graph mutations keyed by target vertex id; drained exactly
    /// once between supersteps by `resolve_mutations`.
    pub mutations: DashMap<I, VertexChanges<I, V, E>>,

    pub aggregator_data: AggregatorServerData,

    resolver: VertexResolver<I, V, E>,
}

impl<I, V, E, M> ServerData<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub fn new(
        types: &TypeSuite<I, V, E, M>,
        layout: PartitionLayout,
        catalog: AggregatorCatalog,
        spill_dir: Option<(PathBuf, usize)>,
    ) -> Result<Self, GraphyneError> {
        let partition_store = match spill_dir {
            Some((dir, max_in_memory)) => {
                PartitionStore::new_disk_backed(layout, dir, max_in_memory)?
            }
            None => PartitionStore::new_in_memory(layout),
        };
        Ok(ServerData {
            layout,
            partition_store,
            message_store: MessageStore::new(types.combiner.clone()),
            mutations: DashMap::new(),
            aggregator_data: AggregatorServerData::new(catalog),
            resolver: VertexResolver::new(
                types.default_vertex_value.clone(),
                types.create_vertex_on_messages,
            ),
        })
    }

    pub fn layout(&self) -> PartitionLayout {
        self.layout
    }

    fn buffer_mutation<F>(&self, vertex: I, apply: F)
    where
        F: FnOnce(&mut VertexChanges<I, V, E>),
    {
        let mut entry = self.mutations.entry(vertex).or_default();
        apply(entry.value_mut());
    }

    /// Applies one request. Safe for concurrent invocation on disjoint
    /// keys; per-partition and per-vertex synchronization is internal.
    pub fn handle(
        &self,
        source: WorkerId,
        request: WorkerRequest<I, V, E, M>,
    ) -> Result<(), GraphyneError> {
        if request.counts_for_flow_control() {
            self.aggregator_data.count_handled_request(source);
        }
        match request {
            WorkerRequest::SendVertices {
                partition,
                vertices,
            } => {
                let mut incoming = Partition::new(partition, self.layout);
                for vertex in vertices {
                    incoming.put_vertex(vertex);
                }
                self.partition_store.add(incoming)?;
            }
            WorkerRequest::SendWorkerMessages { batches } => {
                for (partition, vertices) in batches {
                    for (vertex, messages) in vertices {
                        for message in messages {
                            self.message_store.add_message(
                                partition,
                                vertex.clone(),
                                message,
                            );
                        }
                    }
                }
            }
            WorkerRequest::SendPartitionMutations {
                partition: _,
                mutations,
            } => {
                for (vertex, changes) in mutations {
                    self.buffer_mutation(vertex, |entry| {
                        entry.merge(changes)
                    });
                }
            }
            WorkerRequest::SendAggregators { entries } => {
                self.aggregator_data.receive_from_worker(source, entries)?;
            }
            WorkerRequest::AddEdge { vertex, edge } => {
                self.buffer_mutation(vertex, |entry| entry.add_edge(edge));
            }
            WorkerRequest::RemoveEdge { vertex, target } => {
                self.buffer_mutation(vertex, |entry| {
                    entry.remove_edge(target)
                });
            }
            WorkerRequest::AddVertex { vertex } => {
                self.buffer_mutation(vertex.id().clone(), |entry| {
                    entry.add_vertex(vertex)
                });
            }
            WorkerRequest::RemoveVertex { vertex } => {
                self.buffer_mutation(vertex, |entry| entry.remove_vertex());
            }
            WorkerRequest::Flush => {}
        }
        Ok(())
    }

    /// Drains the mutation buffer and applies it between supersteps.
    /// For every id in the union of buffered changes and pending inbox
    /// messages, in ascending id order, resolves the vertex's next state
    /// against the owning partition. Runs while no compute threads are
    /// active.
    pub fn resolve_mutations<F>(
        &self,
        partition_of: F,
    ) -> Result<(), GraphyneError>
    where
        F: Fn(&I) -> PartitionId,
    {
        // drain the buffer exactly once
        let mut changed: Vec<(I, VertexChanges<I, V, E>)> = Vec::new();
        let ids: Vec<I> =
            self.mutations.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((id, changes)) = self.mutations.remove(&id) {
                changed.push((id, changes));
            }
        }

        // union with inbox destinations so messages to absent vertices can
        // materialize them
        let mut work: std::collections::BTreeMap<
            I,
            Option<VertexChanges<I, V, E>>,
        > = changed
            .into_iter()
            .map(|(id, changes)| (id, Some(changes)))
            .collect();
        for partition in self.message_store.current_partitions() {
            for id in self.message_store.current_destinations(partition) {
                work.entry(id).or_insert(None);
            }
        }

        for (id, changes) in work {
            let partition_id = partition_of(&id);
            let handle = match self.partition_store.get(partition_id)? {
                Some(handle) => handle,
                None => {
                    // the owner published this partition to us; an absent
                    // partition still materializes on first mutation
                    self.partition_store
                        .add(Partition::new(partition_id, self.layout))?;
                    self.partition_store.get(partition_id)?.ok_or_else(
                        || GraphyneError::msg("partition vanished"),
                    )?
                }
            };
            let mut partition = handle.lock();
            let vertex = partition.take_vertex(&id);
            let has_messages =
                self.message_store.has_messages(partition_id, &id);
            match self.resolver.resolve(&id, vertex, changes, has_messages) {
                Some(resolved) => partition.put_vertex(resolved),
                None => {} // deletion scheduled; vertex stays out
            }
        }
        Ok(())
    }
}

/// Messages arriving for vertices this worker owns can shortcut the network
/// path; the processor calls straight into these entry points.
impl<I, V, E, M> ServerData<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub fn local_message(
        &self,
        partition: PartitionId,
        vertex: I,
        message: M,
    ) {
        self.message_store.add_message(partition, vertex, message);
    }

    pub fn local_mutation<F>(&self, vertex: I, apply: F)
    where
        F: FnOnce(&mut VertexChanges<I, V, E>),
    {
        self.buffer_mutation(vertex, apply);
    }

    pub fn local_vertices(
        &self,
        partition: PartitionId,
        vertices: Vec<Vertex<I, V, E>>,
    ) -> Result<(), GraphyneError> {
        let mut incoming = Partition::new(partition, self.layout);
        for vertex in vertices {
            incoming.put_vertex(vertex);
        }
        self.partition_store.add(incoming)
    }
}

/// Shared handle used across servant tasks and the worker runtime.
pub type SharedServerData<I, V, E, M> = Arc<ServerData<I, V, E, M>>;

#[cfg(test)]
mod server_data_tests {
    use super::*;
    use crate::graph::Edge;
    use std::sync::Arc as StdArc;

    type Data = ServerData<i32, i32, i32, i32>;

    fn server_data() -> Data {
        let types: TypeSuite<i32, i32, i32, i32> =
            TypeSuite::new(StdArc::new(|| 0));
        ServerData::new(
            &types,
            PartitionLayout::VertexMap,
            AggregatorCatalog::with_builtins(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn send_vertices_lands_in_store() -> Result<(), GraphyneError> {
        let data = server_data();
        let vertices = (0..10).map(|i| Vertex::new(i, i)).collect();
        data.handle(
            0,
            WorkerRequest::SendVertices {
                partition: 13,
                vertices,
            },
        )?;

        assert!(data.partition_store.has(13));
        let handle = data.partition_store.get(13)?.unwrap();
        let partition = handle.lock();
        let mut total = 0;
        partition.for_each_vertex(|v| total += *v.id())?;
        assert_eq!(total, 45);
        Ok(())
    }

    #[test]
    fn send_worker_messages_sums() -> Result<(), GraphyneError> {
        let data = server_data();
        // vertex i receives messages {0, .., i-1}
        let mut vertices = Vec::new();
        for i in 1..7 {
            vertices.push((i, (0..i).collect::<Vec<i32>>()));
        }
        data.handle(
            0,
            WorkerRequest::SendWorkerMessages {
                batches: vec![(0, vertices)],
            },
        )?;

        let destinations = data.message_store.destination_vertices();
        let key_sum: i32 = destinations.iter().sum();
        assert_eq!(key_sum, 21);

        data.message_store.swap();
        let mut message_sum = 0;
        for vertex in destinations {
            let handle =
                data.message_store.vertex_messages(0, &vertex).unwrap();
            let messages = handle.lock();
            message_sum += messages.iter().sum::<i32>();
        }
        assert_eq!(message_sum, 35);
        Ok(())
    }

    #[test]
    fn send_partition_mutations_accumulates() -> Result<(), GraphyneError> {
        let data = server_data();
        let mut mutations = Vec::new();
        for i in 0..11 {
            let mut changes: VertexChanges<i32, i32, i32> =
                VertexChanges::new();
            for j in 0..3 {
                changes.add_vertex(Vertex::new(i, j));
            }
            for _ in 0..2 {
                changes.remove_vertex();
            }
            for j in 0..5 {
                changes.add_edge(Edge::new(i, 2 * j));
            }
            for j in 0..7 {
                changes.remove_edge(j);
            }
            mutations.push((i, changes));
        }
        data.handle(
            0,
            WorkerRequest::SendPartitionMutations {
                partition: 19,
                mutations,
            },
        )?;

        let mut key_sum = 0;
        for entry in data.mutations.iter() {
            key_sum += *entry.key();
            let changes = entry.value();
            let added_value_sum: i32 =
                changes.added_vertices().iter().map(|v| v.value).sum();
            assert_eq!(added_value_sum, 3);
            assert_eq!(changes.removed_vertex_count(), 2);
            let edge_value_sum: i32 =
                changes.added_edges().iter().map(|e| e.value).sum();
            assert_eq!(edge_value_sum, 20);
            assert_eq!(changes.removed_edges().len(), 7);
        }
        assert_eq!(key_sum, 55);
        Ok(())
    }

    #[test]
    fn single_mutation_requests_buffer() -> Result<(), GraphyneError> {
        let data = server_data();
        data.handle(
            0,
            WorkerRequest::AddVertex {
                vertex: Vertex::new(1, 11),
            },
        )?;
        data.handle(
            0,
            WorkerRequest::AddEdge {
                vertex: 1,
                edge: Edge::new(2, 22),
            },
        )?;
        data.handle(0, WorkerRequest::RemoveVertex { vertex: 3 })?;
        data.handle(
            0,
            WorkerRequest::RemoveEdge {
                vertex: 4,
                target: 5,
            },
        )?;

        assert_eq!(data.mutations.get(&1).unwrap().added_vertices().len(), 1);
        assert_eq!(data.mutations.get(&1).unwrap().added_edges().len(), 1);
        assert_eq!(data.mutations.get(&3).unwrap().removed_vertex_count(), 1);
        assert_eq!(data.mutations.get(&4).unwrap().removed_edges(), &[5]);
        Ok(())
    }

    #[test]
    fn resolve_applies_in_sorted_order() -> Result<(), GraphyneError> {
        let data = server_data();
        data.local_vertices(0, vec![Vertex::new(1, 10), Vertex::new(2, 20)])?;

        // remove vertex 1, add an edge to vertex 2, create vertex 3 via add
        data.local_mutation(1, |c| c.remove_vertex());
        data.local_mutation(2, |c| c.add_edge(Edge::new(9, 99)));
        data.local_mutation(3, |c| c.add_vertex(Vertex::new(3, 30)));
        // message to absent vertex 4 materializes it (create-on-message)
        data.message_store.add_message(0, 4, 7);
        data.message_store.swap();

        data.resolve_mutations(|_| 0)?;

        let handle = data.partition_store.get(0)?.unwrap();
        let partition = handle.lock();
        assert!(!partition.has_vertex(&1));
        assert_eq!(partition.get_vertex(&2).unwrap().num_edges(), 1);
        assert_eq!(partition.get_vertex(&3).unwrap().value, 30);
        assert_eq!(partition.get_vertex(&4).unwrap().value, 0);
        assert!(data.mutations.is_empty());
        Ok(())
    }
}
