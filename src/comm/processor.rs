//! Request processor: routes outgoing vertex-addressed work items to the
//! owner of the destination partition, coalescing messages and mutations
//! into per-partition batches up to a soft byte threshold. Items bound for
//! partitions this worker owns shortcut straight into local server data.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::comm::{PartitionOwner, WorkerRequest};
use crate::graph::{
    Edge, PartitionId, Vertex, VertexChanges, VertexId, WireData, WorkerId,
};
use crate::utils::GraphyneError;
use crate::worker::SharedServerData;

/// Item handed to the dispatcher task feeding the request client.
pub enum OutboundItem<I, V, E, M> {
    /// A request bound for a destination worker.
    Request(WorkerId, WorkerRequest<I, V, E, M>),

    /// Flush point: the dispatcher drains the client's outstanding window
    /// and then completes the handle.
    FlushPoint(oneshot::Sender<()>),
}

struct MessageBatch<I, M> {
    bytes: usize,
    partitions: HashMap<PartitionId, HashMap<I, Vec<M>>>,
}

impl<I, M> Default for MessageBatch<I, M> {
    fn default() -> Self {
        MessageBatch {
            bytes: 0,
            partitions: HashMap::new(),
        }
    }
}

struct MutationBatch<I, V, E> {
    bytes: usize,
    partitions: HashMap<PartitionId, HashMap<I, VertexChanges<I, V, E>>>,
}

impl<I, V, E> Default for MutationBatch<I, V, E> {
    fn default() -> Self {
        MutationBatch {
            bytes: 0,
            partitions: HashMap::new(),
        }
    }
}

struct Buffers<I, V, E, M> {
    messages: HashMap<WorkerId, MessageBatch<I, M>>,
    mutations: HashMap<WorkerId, MutationBatch<I, V, E>>,
}

/// Owner-routing, batching request processor. Methods are synchronous and
/// thread-safe; compute threads call them directly.
pub struct RequestProcessor<I, V, E, M> {
    me: WorkerId,

    /// Partition ownership published by the master for this superstep.
    owners: RwLock<HashMap<PartitionId, PartitionOwner>>,

    local: SharedServerData<I, V, E, M>,

    tx_out: mpsc::Sender<OutboundItem<I, V, E, M>>,

    /// Soft byte threshold per destination batch.
    batch_bytes: usize,

    buffers: Mutex<Buffers<I, V, E, M>>,

    /// Messages produced during the running superstep (local + remote).
    messages_sent: AtomicU64,
}

impl<I, V, E, M> RequestProcessor<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub fn new(
        me: WorkerId,
        local: SharedServerData<I, V, E, M>,
        tx_out: mpsc::Sender<OutboundItem<I, V, E, M>>,
        batch_bytes: usize,
    ) -> Self {
        RequestProcessor {
            me,
            owners: RwLock::new(HashMap::new()),
            local,
            tx_out,
            batch_bytes,
            buffers: Mutex::new(Buffers {
                messages: HashMap::new(),
                mutations: HashMap::new(),
            }),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Installs the partition ownership for the coming superstep.
    pub fn set_owners(&self, owners: Vec<PartitionOwner>) {
        let mut map = self.owners.write();
        map.clear();
        for owner in owners {
            map.insert(owner.partition, owner);
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.owners.read().len()
    }

    /// The partition a vertex id belongs to: stable hash modulo the job's
    /// partition count.
    pub fn partition_for(&self, id: &I) -> PartitionId {
        let num_partitions = self.num_partitions().max(1) as u64;
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % num_partitions) as PartitionId
    }

    /// Looks up the owner of a partition.
    pub fn owner_of(
        &self,
        partition: PartitionId,
    ) -> Result<PartitionOwner, GraphyneError> {
        self.owners.read().get(&partition).cloned().ok_or_else(|| {
            GraphyneError::msg(format!(
                "no owner published for partition {}",
                partition
            ))
        })
    }

    /// Partitions this worker owns in the current superstep, ascending.
    pub fn my_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self
            .owners
            .read()
            .values()
            .filter(|owner| owner.worker == self.me)
            .map(|owner| owner.partition)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Messages produced since the last reset.
    pub fn reset_message_count(&self) -> u64 {
        self.messages_sent.swap(0, Ordering::AcqRel)
    }

    fn enqueue(
        &self,
        dest: WorkerId,
        request: WorkerRequest<I, V, E, M>,
    ) -> Result<(), GraphyneError> {
        self.tx_out
            .blocking_send(OutboundItem::Request(dest, request))
            .map_err(|_| GraphyneError::msg("dispatcher channel closed"))
    }

    /// Sends a message to the destination vertex for delivery in the next
    /// superstep.
    pub fn send_message(
        &self,
        target: I,
        message: M,
    ) -> Result<(), GraphyneError> {
        let partition = self.partition_for(&target);
        let owner = self.owner_of(partition)?;
        self.messages_sent.fetch_add(1, Ordering::AcqRel);

        if owner.worker == self.me {
            self.local.local_message(partition, target, message);
            return Ok(());
        }

        let entry_bytes =
            target.to_bytes().len() + message.to_bytes().len() + 8;
        let ready = {
            let mut buffers = self.buffers.lock();
            let batch = buffers.messages.entry(owner.worker).or_default();
            batch
                .partitions
                .entry(partition)
                .or_default()
                .entry(target)
                .or_default()
                .push(message);
            batch.bytes += entry_bytes;
            if batch.bytes >= self.batch_bytes {
                buffers.messages.remove(&owner.worker)
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.enqueue(owner.worker, Self::message_request(batch))?;
        }
        Ok(())
    }

    fn message_request(
        batch: MessageBatch<I, M>,
    ) -> WorkerRequest<I, V, E, M> {
        let mut batches: Vec<(PartitionId, Vec<(I, Vec<M>)>)> = batch
            .partitions
            .into_iter()
            .map(|(partition, vertices)| {
                let mut vertices: Vec<(I, Vec<M>)> =
                    vertices.into_iter().collect();
                vertices.sort_by(|a, b| a.0.cmp(&b.0));
                (partition, vertices)
            })
            .collect();
        batches.sort_by_key(|(partition, _)| *partition);
        WorkerRequest::SendWorkerMessages { batches }
    }

    fn buffer_mutation<F>(
        &self,
        vertex: I,
        apply: F,
    ) -> Result<(), GraphyneError>
    where
        F: FnOnce(&mut VertexChanges<I, V, E>),
    {
        let partition = self.partition_for(&vertex);
        let owner = self.owner_of(partition)?;

        if owner.worker == self.me {
            self.local.local_mutation(vertex, apply);
            return Ok(());
        }

        let entry_bytes = vertex.to_bytes().len() + 16;
        let ready = {
            let mut buffers = self.buffers.lock();
            let batch = buffers.mutations.entry(owner.worker).or_default();
            apply(
                batch
                    .partitions
                    .entry(partition)
                    .or_default()
                    .entry(vertex)
                    .or_default(),
            );
            batch.bytes += entry_bytes;
            if batch.bytes >= self.batch_bytes {
                buffers.mutations.remove(&owner.worker)
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            for request in Self::mutation_requests(batch) {
                self.enqueue(owner.worker, request)?;
            }
        }
        Ok(())
    }

    fn mutation_requests(
        batch: MutationBatch<I, V, E>,
    ) -> Vec<WorkerRequest<I, V, E, M>> {
        let mut requests = Vec::new();
        let mut partitions: Vec<_> = batch.partitions.into_iter().collect();
        partitions.sort_by_key(|(partition, _)| *partition);
        for (partition, vertices) in partitions {
            let mut mutations: Vec<(I, VertexChanges<I, V, E>)> =
                vertices.into_iter().collect();
            mutations.sort_by(|a, b| a.0.cmp(&b.0));
            requests.push(WorkerRequest::SendPartitionMutations {
                partition,
                mutations,
            });
        }
        requests
    }

    /// Requests addition of a vertex at its owner.
    pub fn add_vertex_request(
        &self,
        vertex: Vertex<I, V, E>,
    ) -> Result<(), GraphyneError> {
        self.buffer_mutation(vertex.id().clone(), |changes| {
            changes.add_vertex(vertex)
        })
    }

    /// Requests removal of a vertex at its owner.
    pub fn remove_vertex_request(
        &self,
        vertex: I,
    ) -> Result<(), GraphyneError> {
        self.buffer_mutation(vertex, |changes| changes.remove_vertex())
    }

    /// Requests addition of an out-edge on the source vertex.
    pub fn add_edge_request(
        &self,
        source: I,
        edge: Edge<I, E>,
    ) -> Result<(), GraphyneError> {
        self.buffer_mutation(source, |changes| changes.add_edge(edge))
    }

    /// Requests removal of the first matching out-edge on the source vertex.
    pub fn remove_edge_request(
        &self,
        source: I,
        target: I,
    ) -> Result<(), GraphyneError> {
        self.buffer_mutation(source, |changes| changes.remove_edge(target))
    }

    /// Routes freshly read vertices to their partition owner (input
    /// superstep; no batching across partitions).
    pub fn send_vertices(
        &self,
        partition: PartitionId,
        vertices: Vec<Vertex<I, V, E>>,
    ) -> Result<(), GraphyneError> {
        let owner = self.owner_of(partition)?;
        if owner.worker == self.me {
            self.local.local_vertices(partition, vertices)
        } else {
            self.enqueue(
                owner.worker,
                WorkerRequest::SendVertices {
                    partition,
                    vertices,
                },
            )
        }
    }

    /// Ships aggregator partial entries to their owning worker.
    pub fn send_aggregators(
        &self,
        dest: WorkerId,
        entries: Vec<(String, String, Vec<u8>)>,
    ) -> Result<(), GraphyneError> {
        if dest == self.me {
            self.local
                .aggregator_data
                .receive_from_worker(self.me, entries)
        } else {
            self.enqueue(dest, WorkerRequest::SendAggregators { entries })
        }
    }

    /// Drains every buffered batch into the dispatcher.
    pub fn flush(&self) -> Result<(), GraphyneError> {
        let (messages, mutations) = {
            let mut buffers = self.buffers.lock();
            (
                std::mem::take(&mut buffers.messages),
                std::mem::take(&mut buffers.mutations),
            )
        };
        for (dest, batch) in messages {
            self.enqueue(dest, Self::message_request(batch))?;
        }
        for (dest, batch) in mutations {
            for request in Self::mutation_requests(batch) {
                self.enqueue(dest, request)?;
            }
        }
        Ok(())
    }

    /// Async flush point: after all buffered work is dispatched, resolves
    /// once the client has drained its outstanding window.
    pub async fn flush_and_wait(&self) -> Result<(), GraphyneError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_out
            .send(OutboundItem::FlushPoint(tx_done))
            .await
            .map_err(|_| GraphyneError::msg("dispatcher channel closed"))?;
        rx_done
            .await
            .map_err(|_| GraphyneError::msg("dispatcher dropped flush point"))
    }

    /// Every worker that currently owns at least one partition, ascending.
    pub fn all_workers(&self) -> Vec<(WorkerId, std::net::SocketAddr)> {
        let mut workers: Vec<(WorkerId, std::net::SocketAddr)> = self
            .owners
            .read()
            .values()
            .map(|owner| (owner.worker, owner.addr))
            .collect();
        workers.sort_by_key(|(id, _)| *id);
        workers.dedup_by_key(|(id, _)| *id);
        workers
    }
}

#[cfg(test)]
mod processor_tests {
    use super::*;
    use crate::graph::{
        AggregatorCatalog, PartitionLayout, TypeSuite,
    };
    use crate::worker::ServerData;
    use std::sync::Arc;

    type Proc = RequestProcessor<i32, i32, i32, i32>;

    fn setup(
        me: WorkerId,
        batch_bytes: usize,
    ) -> (Arc<Proc>, mpsc::Receiver<OutboundItem<i32, i32, i32, i32>>) {
        let types: TypeSuite<i32, i32, i32, i32> =
            TypeSuite::new(Arc::new(|| 0));
        let data = Arc::new(
            ServerData::new(
                &types,
                PartitionLayout::VertexMap,
                AggregatorCatalog::with_builtins(),
                None,
            )
            .unwrap(),
        );
        let (tx_out, rx_out) = mpsc::channel(64);
        let processor =
            Arc::new(RequestProcessor::new(me, data, tx_out, batch_bytes));
        // two partitions: 0 owned by me, 1 owned by worker 1
        processor.set_owners(vec![
            PartitionOwner {
                partition: 0,
                worker: me,
                addr: "127.0.0.1:0".parse().unwrap(),
            },
            PartitionOwner {
                partition: 1,
                worker: 1,
                addr: "127.0.0.1:1".parse().unwrap(),
            },
        ]);
        (processor, rx_out)
    }

    fn id_for_partition(processor: &Proc, partition: PartitionId) -> i32 {
        (0..).find(|id| processor.partition_for(id) == partition).unwrap()
    }

    #[test]
    fn local_messages_shortcut_network() -> Result<(), GraphyneError> {
        let (processor, mut rx) = setup(0, 1 << 20);
        let local_id = id_for_partition(&processor, 0);
        processor.send_message(local_id, 7)?;

        assert_eq!(processor.local.message_store.num_pending_messages(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.reset_message_count(), 1);
        assert_eq!(processor.reset_message_count(), 0);
        Ok(())
    }

    #[test]
    fn remote_messages_batch_until_threshold() -> Result<(), GraphyneError> {
        let (processor, mut rx) = setup(0, 64);
        let remote_id = id_for_partition(&processor, 1);

        // small sends stay buffered
        processor.send_message(remote_id, 1)?;
        assert!(rx.try_recv().is_err());

        // crossing the soft threshold flushes a batched request
        for i in 0..8 {
            processor.send_message(remote_id, i)?;
        }
        match rx.try_recv() {
            Ok(OutboundItem::Request(
                1,
                WorkerRequest::SendWorkerMessages { batches },
            )) => {
                assert_eq!(batches.len(), 1);
                assert_eq!(batches[0].0, 1);
            }
            _ => panic!("expected a batched message request"),
        }
        Ok(())
    }

    #[test]
    fn flush_drains_buffers() -> Result<(), GraphyneError> {
        let (processor, mut rx) = setup(0, 1 << 20);
        let remote_id = id_for_partition(&processor, 1);
        processor.send_message(remote_id, 5)?;
        processor.remove_vertex_request(remote_id)?;
        processor.flush()?;

        let mut saw_messages = false;
        let mut saw_mutations = false;
        while let Ok(item) = rx.try_recv() {
            match item {
                OutboundItem::Request(
                    1,
                    WorkerRequest::SendWorkerMessages { .. },
                ) => saw_messages = true,
                OutboundItem::Request(
                    1,
                    WorkerRequest::SendPartitionMutations { .. },
                ) => saw_mutations = true,
                _ => {}
            }
        }
        assert!(saw_messages);
        assert!(saw_mutations);
        Ok(())
    }

    #[test]
    fn local_mutations_land_in_buffer() -> Result<(), GraphyneError> {
        let (processor, _rx) = setup(0, 1 << 20);
        let local_id = id_for_partition(&processor, 0);
        processor.remove_vertex_request(local_id)?;
        assert_eq!(
            processor
                .local
                .mutations
                .get(&local_id)
                .unwrap()
                .removed_vertex_count(),
            1
        );
        Ok(())
    }
}
