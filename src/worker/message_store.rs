//! Message store: accumulates per-vertex incoming messages for the next
//! superstep, with an optional combiner keeping one aggregate per vertex.
//! Writes always target the next-superstep inbox; compute reads only the
//! frozen inbox rolled in by `swap()` at the superstep boundary.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::graph::{PartitionId, VertexId, WireData};
use crate::program::Combiner;

/// Shared handle to one vertex's message sequence. Iteration goes through
/// the mutex, which is the synchronization the contract requires of callers.
pub type MessageHandle<M> = Arc<Mutex<Vec<M>>>;

type MsgMap<I, M> = DashMap<PartitionId, DashMap<I, MessageHandle<M>>>;

/// Double-buffered per-vertex message inbox.
pub struct MessageStore<I, M> {
    /// Frozen inbox read by the current superstep's compute pass.
    current: RwLock<MsgMap<I, M>>,

    /// Inbox receiving messages destined for the next superstep.
    next: RwLock<MsgMap<I, M>>,

    combiner: Option<Arc<dyn Combiner<M>>>,
}

impl<I: VertexId, M: WireData> MessageStore<I, M> {
    pub fn new(combiner: Option<Arc<dyn Combiner<M>>>) -> Self {
        MessageStore {
            current: RwLock::new(DashMap::new()),
            next: RwLock::new(DashMap::new()),
            combiner,
        }
    }

    /// Adds a message for a vertex into the next-superstep inbox. Safe for
    /// concurrent callers targeting the same vertex.
    pub fn add_message(
        &self,
        partition: PartitionId,
        vertex: I,
        message: M,
    ) {
        let next = self.next.read();
        let partition_map = next.entry(partition).or_default();
        let handle = partition_map
            .entry(vertex)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        drop(partition_map);

        let mut messages = handle.lock();
        match &self.combiner {
            Some(combiner) => {
                if messages.is_empty() {
                    let mut combined = combiner.initial();
                    combiner.combine(&mut combined, message);
                    messages.push(combined);
                } else {
                    combiner.combine(&mut messages[0], message);
                }
            }
            None => messages.push(message),
        }
    }

    /// Messages for a vertex in the current (frozen) inbox.
    pub fn vertex_messages(
        &self,
        partition: PartitionId,
        vertex: &I,
    ) -> Option<MessageHandle<M>> {
        let current = self.current.read();
        let partition_map = current.get(&partition)?;
        let handle = partition_map.get(vertex)?;
        Some(handle.clone())
    }

    /// Whether the current inbox holds messages for a vertex.
    pub fn has_messages(&self, partition: PartitionId, vertex: &I) -> bool {
        self.vertex_messages(partition, vertex)
            .map(|h| !h.lock().is_empty())
            .unwrap_or(false)
    }

    /// All destination vertex ids in the receiving (next-superstep) inbox.
    pub fn destination_vertices(&self) -> Vec<I> {
        let next = self.next.read();
        let mut ids = Vec::new();
        for partition_map in next.iter() {
            for entry in partition_map.value().iter() {
                ids.push(entry.key().clone());
            }
        }
        ids
    }

    /// Partitions with entries in the current inbox.
    pub fn current_partitions(&self) -> Vec<PartitionId> {
        self.current.read().iter().map(|entry| *entry.key()).collect()
    }

    /// Destination vertex ids of one partition in the current inbox, used by
    /// the resolver to union pending messages with buffered mutations.
    pub fn current_destinations(&self, partition: PartitionId) -> Vec<I> {
        let current = self.current.read();
        let result = match current.get(&partition) {
            Some(partition_map) => partition_map
                .iter()
                .filter(|entry| !entry.value().lock().is_empty())
                .map(|entry| entry.key().clone())
                .collect(),
            None => Vec::new(),
        };
        result
    }

    /// Drops all messages (both inboxes) targeting a partition.
    pub fn clear_partition(&self, partition: PartitionId) {
        self.current.read().remove(&partition);
        self.next.read().remove(&partition);
    }

    /// Atomic roll at the superstep boundary: the next-superstep inbox
    /// becomes current; the previous current inbox is cleared.
    pub fn swap(&self) {
        let mut current = self.current.write();
        let mut next = self.next.write();
        std::mem::swap(&mut *current, &mut *next);
        next.clear();
    }

    /// Clones the current inbox out for checkpointing.
    pub fn export_current(
        &self,
    ) -> Vec<(PartitionId, Vec<(Vec<u8>, Vec<Vec<u8>>)>)> {
        let current = self.current.read();
        let mut out = Vec::new();
        for partition_map in current.iter() {
            let mut vertices = Vec::new();
            for entry in partition_map.value().iter() {
                let messages =
                    entry.value().lock().iter().map(M::to_bytes).collect();
                vertices.push((entry.key().to_bytes(), messages));
            }
            vertices.sort();
            out.push((*partition_map.key(), vertices));
        }
        out.sort_by_key(|(partition, _)| *partition);
        out
    }

    /// Restores the current inbox from a checkpoint export.
    pub fn restore_current(
        &self,
        exported: Vec<(PartitionId, Vec<(Vec<u8>, Vec<Vec<u8>>)>)>,
    ) -> Result<(), crate::utils::GraphyneError> {
        let current = self.current.write();
        current.clear();
        for (partition, vertices) in exported {
            let partition_map: DashMap<I, MessageHandle<M>> = DashMap::new();
            for (id_bytes, message_bytes) in vertices {
                let id = I::from_bytes(&id_bytes)?;
                let messages = message_bytes
                    .iter()
                    .map(|b| M::from_bytes(b))
                    .collect::<Result<Vec<_>, _>>()?;
                partition_map.insert(id, Arc::new(Mutex::new(messages)));
            }
            current.insert(partition, partition_map);
        }
        Ok(())
    }

    /// Number of messages sitting in the receiving inbox.
    pub fn num_pending_messages(&self) -> u64 {
        let next = self.next.read();
        let mut count = 0u64;
        for partition_map in next.iter() {
            for entry in partition_map.value().iter() {
                count += entry.value().lock().len() as u64;
            }
        }
        count
    }
}

#[cfg(test)]
mod message_store_tests {
    use super::*;

    struct SumCombiner;

    impl Combiner<i32> for SumCombiner {
        fn combine(&self, original: &mut i32, other: i32) {
            *original += other;
        }

        fn initial(&self) -> i32 {
            0
        }
    }

    #[test]
    fn append_only_without_combiner() {
        let store: MessageStore<i32, i32> = MessageStore::new(None);
        store.add_message(0, 1, 10);
        store.add_message(0, 1, 20);
        store.add_message(0, 2, 30);

        assert_eq!(store.destination_vertices().len(), 2);
        assert_eq!(store.num_pending_messages(), 3);

        // not visible to compute until swapped in
        assert!(store.vertex_messages(0, &1).is_none());
        store.swap();
        let handle = store.vertex_messages(0, &1).unwrap();
        assert_eq!(*handle.lock(), vec![10, 20]);
        assert_eq!(store.num_pending_messages(), 0);
    }

    #[test]
    fn combiner_keeps_single_message() {
        let store: MessageStore<i32, i32> =
            MessageStore::new(Some(Arc::new(SumCombiner)));
        for i in 1..=5 {
            store.add_message(0, 7, i);
        }
        store.swap();
        let handle = store.vertex_messages(0, &7).unwrap();
        assert_eq!(*handle.lock(), vec![15]);
    }

    #[test]
    fn swap_clears_previous_current() {
        let store: MessageStore<i32, i32> = MessageStore::new(None);
        store.add_message(0, 1, 1);
        store.swap();
        assert!(store.has_messages(0, &1));

        store.add_message(0, 2, 2);
        store.swap();
        assert!(!store.has_messages(0, &1));
        assert!(store.has_messages(0, &2));
    }

    #[test]
    fn clear_partition_drops_both_sides() {
        let store: MessageStore<i32, i32> = MessageStore::new(None);
        store.add_message(3, 1, 1);
        store.swap();
        store.add_message(3, 2, 2);
        store.clear_partition(3);
        assert!(!store.has_messages(3, &1));
        assert_eq!(store.num_pending_messages(), 0);
    }

    #[test]
    fn checkpoint_export_restore() {
        let store: MessageStore<i32, i32> = MessageStore::new(None);
        store.add_message(0, 1, 11);
        store.add_message(1, 2, 22);
        store.swap();

        let exported = store.export_current();
        let other: MessageStore<i32, i32> = MessageStore::new(None);
        other.restore_current(exported).unwrap();
        assert_eq!(*other.vertex_messages(0, &1).unwrap().lock(), vec![11]);
        assert_eq!(*other.vertex_messages(1, &2).unwrap().lock(), vec![22]);
    }
}
