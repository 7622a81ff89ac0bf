//! Partition stores: hold the worker's share of the graph. The resident
//! variant keeps everything in memory behind per-id locks; the disk-backed
//! variant caps resident partitions and spills least-recently-used ones to
//! per-partition files.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::graph::{
    Partition, PartitionId, PartitionLayout, VertexId, WireData,
};
use crate::utils::GraphyneError;

/// Shared handle to a live partition. Concurrent access to the same
/// partition id is serialized through the mutex.
pub type PartitionHandle<I, V, E> = Arc<Mutex<Partition<I, V, E>>>;

/// Store variant chosen by configuration.
pub enum PartitionStore<I, V, E> {
    Memory(MemoryPartitionStore<I, V, E>),
    Disk(DiskBackedPartitionStore<I, V, E>),
}

impl<I: VertexId, V: WireData, E: WireData> PartitionStore<I, V, E> {
    /// Creates the resident in-memory store.
    pub fn new_in_memory(layout: PartitionLayout) -> Self {
        PartitionStore::Memory(MemoryPartitionStore::new(layout))
    }

    /// Creates the disk-backed store spilling under `dir`, keeping at most
    /// `max_in_memory` partitions resident.
    pub fn new_disk_backed(
        layout: PartitionLayout,
        dir: PathBuf,
        max_in_memory: usize,
    ) -> Result<Self, GraphyneError> {
        Ok(PartitionStore::Disk(DiskBackedPartitionStore::new(
            layout,
            dir,
            max_in_memory,
        )?))
    }

    /// Adds a partition, folding its vertices into any existing partition
    /// with the same id (last write wins per vertex id).
    pub fn add(
        &self,
        partition: Partition<I, V, E>,
    ) -> Result<(), GraphyneError> {
        match self {
            PartitionStore::Memory(s) => s.add(partition),
            PartitionStore::Disk(s) => s.add(partition),
        }
    }

    /// Returns a live handle to a partition, loading it from disk if spilled.
    pub fn get(
        &self,
        id: PartitionId,
    ) -> Result<Option<PartitionHandle<I, V, E>>, GraphyneError> {
        match self {
            PartitionStore::Memory(s) => Ok(s.get(id)),
            PartitionStore::Disk(s) => s.get(id),
        }
    }

    /// Detaches and returns a partition; the caller takes ownership.
    pub fn remove(
        &self,
        id: PartitionId,
    ) -> Result<Option<Partition<I, V, E>>, GraphyneError> {
        match self {
            PartitionStore::Memory(s) => Ok(s.remove(id)),
            PartitionStore::Disk(s) => s.remove(id),
        }
    }

    /// Discards a partition (and any spill file).
    pub fn delete(&self, id: PartitionId) -> Result<(), GraphyneError> {
        match self {
            PartitionStore::Memory(s) => {
                s.remove(id);
                Ok(())
            }
            PartitionStore::Disk(s) => s.delete(id),
        }
    }

    pub fn has(&self, id: PartitionId) -> bool {
        match self {
            PartitionStore::Memory(s) => s.has(id),
            PartitionStore::Disk(s) => s.has(id),
        }
    }

    /// Ids of all partitions currently in the store, ascending.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids = match self {
            PartitionStore::Memory(s) => s.partition_ids(),
            PartitionStore::Disk(s) => s.partition_ids(),
        };
        ids.sort_unstable();
        ids
    }

    pub fn num_partitions(&self) -> usize {
        match self {
            PartitionStore::Memory(s) => s.num_partitions(),
            PartitionStore::Disk(s) => s.num_partitions(),
        }
    }

    pub fn layout(&self) -> PartitionLayout {
        match self {
            PartitionStore::Memory(s) => s.layout,
            PartitionStore::Disk(s) => s.layout,
        }
    }
}

/// All partitions resident in memory, protected by per-id locking for
/// `get`/`add` composition.
pub struct MemoryPartitionStore<I, V, E> {
    partitions: RwLock<HashMap<PartitionId, PartitionHandle<I, V, E>>>,
    layout: PartitionLayout,
}

impl<I: VertexId, V: WireData, E: WireData> MemoryPartitionStore<I, V, E> {
    pub fn new(layout: PartitionLayout) -> Self {
        MemoryPartitionStore {
            partitions: RwLock::new(HashMap::new()),
            layout,
        }
    }

    pub fn add(
        &self,
        partition: Partition<I, V, E>,
    ) -> Result<(), GraphyneError> {
        let mut partitions = self.partitions.write();
        match partitions.get(&partition.id()) {
            Some(existing) => {
                existing.lock().merge(partition);
            }
            None => {
                partitions.insert(
                    partition.id(),
                    Arc::new(Mutex::new(partition)),
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, id: PartitionId) -> Option<PartitionHandle<I, V, E>> {
        self.partitions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: PartitionId) -> Option<Partition<I, V, E>> {
        let handle = self.partitions.write().remove(&id)?;
        Some(unwrap_handle(handle))
    }

    pub fn has(&self, id: PartitionId) -> bool {
        self.partitions.read().contains_key(&id)
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.read().keys().copied().collect()
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.read().len()
    }
}

enum Slot {
    Resident,
    OnDisk,
}

struct DiskStoreInner<I, V, E> {
    resident: HashMap<PartitionId, PartitionHandle<I, V, E>>,
    // least-recently-used order over resident ids, oldest first
    lru: VecDeque<PartitionId>,
    on_disk: HashSet<PartitionId>,
}

/// Holds at most K partitions resident; evicts least-recently-used ones to
/// stable per-partition files. The store-wide mutex covers the LRU
/// bookkeeping; eviction and on-demand load both run inside it, so
/// concurrent gets of a non-resident partition deduplicate into one load.
pub struct DiskBackedPartitionStore<I, V, E> {
    inner: Mutex<DiskStoreInner<I, V, E>>,
    dir: PathBuf,
    max_in_memory: usize,
    layout: PartitionLayout,
}

impl<I: VertexId, V: WireData, E: WireData> DiskBackedPartitionStore<I, V, E> {
    pub fn new(
        layout: PartitionLayout,
        dir: PathBuf,
        max_in_memory: usize,
    ) -> Result<Self, GraphyneError> {
        if max_in_memory == 0 {
            return Err(GraphyneError::msg(
                "max_partitions_in_memory must be >= 1",
            ));
        }
        fs::create_dir_all(&dir)?;
        Ok(DiskBackedPartitionStore {
            inner: Mutex::new(DiskStoreInner {
                resident: HashMap::new(),
                lru: VecDeque::new(),
                on_disk: HashSet::new(),
            }),
            dir,
            max_in_memory,
            layout,
        })
    }

    fn spill_path(&self, id: PartitionId) -> PathBuf {
        self.dir.join(format!("partition-{}.bin", id))
    }

    fn slot(inner: &DiskStoreInner<I, V, E>, id: PartitionId) -> Option<Slot> {
        if inner.resident.contains_key(&id) {
            Some(Slot::Resident)
        } else if inner.on_disk.contains(&id) {
            Some(Slot::OnDisk)
        } else {
            None
        }
    }

    fn touch(inner: &mut DiskStoreInner<I, V, E>, id: PartitionId) {
        inner.lru.retain(|&p| p != id);
        inner.lru.push_back(id);
    }

    /// Writes a partition to its spill file.
    fn write_spill(
        &self,
        partition: &Partition<I, V, E>,
    ) -> Result<(), GraphyneError> {
        let mut buf = BytesMut::new();
        partition.write(&mut buf)?;
        fs::write(self.spill_path(partition.id()), &buf)?;
        Ok(())
    }

    /// Loads a partition back from its spill file. Failure here is fatal.
    fn read_spill(
        &self,
        id: PartitionId,
    ) -> Result<Partition<I, V, E>, GraphyneError> {
        let bytes = fs::read(self.spill_path(id))?;
        let mut buf = Bytes::from(bytes);
        Partition::read_fields(&mut buf, self.layout)
    }

    /// Evicts least-recently-used residents until at most `budget` remain.
    /// Runs inside the caller's critical section.
    fn evict_down_to(
        &self,
        inner: &mut DiskStoreInner<I, V, E>,
        budget: usize,
        keep: PartitionId,
    ) -> Result<(), GraphyneError> {
        while inner.resident.len() > budget {
            let victim = match inner.lru.iter().find(|&&p| p != keep) {
                Some(&victim) => victim,
                None => break, // only the protected id remains
            };
            inner.lru.retain(|&p| p != victim);
            if let Some(handle) = inner.resident.remove(&victim) {
                let partition = handle.lock();
                self.write_spill(&partition)?;
                inner.on_disk.insert(victim);
                pf_debug!("store"; "evicted partition {} to disk", victim);
            }
        }
        Ok(())
    }

    /// Makes a partition resident (loading it if spilled), touching the LRU.
    fn ensure_resident(
        &self,
        inner: &mut DiskStoreInner<I, V, E>,
        id: PartitionId,
    ) -> Result<Option<PartitionHandle<I, V, E>>, GraphyneError> {
        match Self::slot(inner, id) {
            None => Ok(None),
            Some(Slot::Resident) => {
                Self::touch(inner, id);
                Ok(inner.resident.get(&id).cloned())
            }
            Some(Slot::OnDisk) => {
                let partition = self.read_spill(id)?;
                inner.on_disk.remove(&id);
                let handle = Arc::new(Mutex::new(partition));
                inner.resident.insert(id, handle.clone());
                Self::touch(inner, id);
                self.evict_down_to(inner, self.max_in_memory, id)?;
                Ok(Some(handle))
            }
        }
    }

    pub fn add(
        &self,
        partition: Partition<I, V, E>,
    ) -> Result<(), GraphyneError> {
        let id = partition.id();
        let mut inner = self.inner.lock();
        match self.ensure_resident(&mut inner, id)? {
            Some(existing) => {
                existing.lock().merge(partition);
            }
            None => {
                inner.resident.insert(id, Arc::new(Mutex::new(partition)));
                Self::touch(&mut inner, id);
                self.evict_down_to(&mut inner, self.max_in_memory, id)?;
            }
        }
        Ok(())
    }

    pub fn get(
        &self,
        id: PartitionId,
    ) -> Result<Option<PartitionHandle<I, V, E>>, GraphyneError> {
        let mut inner = self.inner.lock();
        self.ensure_resident(&mut inner, id)
    }

    pub fn remove(
        &self,
        id: PartitionId,
    ) -> Result<Option<Partition<I, V, E>>, GraphyneError> {
        let mut inner = self.inner.lock();
        match self.ensure_resident(&mut inner, id)? {
            None => Ok(None),
            Some(_) => {
                inner.lru.retain(|&p| p != id);
                let handle = inner.resident.remove(&id).unwrap();
                let _ = fs::remove_file(self.spill_path(id));
                Ok(Some(unwrap_handle(handle)))
            }
        }
    }

    pub fn delete(&self, id: PartitionId) -> Result<(), GraphyneError> {
        let mut inner = self.inner.lock();
        inner.lru.retain(|&p| p != id);
        inner.resident.remove(&id);
        if inner.on_disk.remove(&id) {
            let _ = fs::remove_file(self.spill_path(id));
        }
        Ok(())
    }

    pub fn has(&self, id: PartitionId) -> bool {
        let inner = self.inner.lock();
        Self::slot(&inner, id).is_some()
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let inner = self.inner.lock();
        inner
            .resident
            .keys()
            .copied()
            .chain(inner.on_disk.iter().copied())
            .collect()
    }

    pub fn num_partitions(&self) -> usize {
        let inner = self.inner.lock();
        inner.resident.len() + inner.on_disk.len()
    }
}

/// Takes a partition out of its shared handle. The detach contract says the
/// caller owns it now; any straggler handle keeps a stale clone.
fn unwrap_handle<I: VertexId, V: WireData, E: WireData>(
    handle: PartitionHandle<I, V, E>,
) -> Partition<I, V, E> {
    match Arc::try_unwrap(handle) {
        Ok(mutex) => mutex.into_inner(),
        Err(shared) => shared.lock().clone(),
    }
}

#[cfg(test)]
mod partition_store_tests {
    use super::*;
    use crate::graph::Vertex;

    fn vertex(id: i32) -> Vertex<i32, i32, ()> {
        Vertex::new(id, id)
    }

    fn partition(
        id: PartitionId,
        vertices: &[i32],
    ) -> Partition<i32, i32, ()> {
        let mut p = Partition::new(id, PartitionLayout::VertexMap);
        for &v in vertices {
            p.put_vertex(vertex(v));
        }
        p
    }

    fn check_read_write(
        store: &PartitionStore<i32, i32, ()>,
    ) -> Result<(), GraphyneError> {
        store.add(partition(1, &[1, 2]))?;
        store.add(partition(2, &[3]))?;
        store.add(partition(2, &[4]))?;
        store.add(partition(3, &[5]))?;
        store.add(partition(1, &[7]))?;
        store.add(partition(4, &[6]))?;

        let p1 = store.get(1)?.unwrap();
        let p2 = store.get(2)?.unwrap();
        let p3 = store.remove(3)?.unwrap();
        let p4 = store.get(4)?.unwrap();

        assert_eq!(store.num_partitions(), 3);
        assert_eq!(store.partition_ids().len(), 3);
        assert!(store.has(1));
        assert!(store.has(2));
        assert!(!store.has(3));
        assert!(store.has(4));
        assert_eq!(p1.lock().vertex_count(), 3);
        assert_eq!(p2.lock().vertex_count(), 2);
        assert_eq!(p3.vertex_count(), 1);
        assert_eq!(p4.lock().vertex_count(), 1);
        drop(p1);
        drop(p2);
        drop(p4);

        store.delete(2)?;
        assert_eq!(store.num_partitions(), 2);
        Ok(())
    }

    #[test]
    fn memory_store_read_write() -> Result<(), GraphyneError> {
        let store = PartitionStore::new_in_memory(PartitionLayout::VertexMap);
        check_read_write(&store)
    }

    #[test]
    fn disk_backed_store_read_write() -> Result<(), GraphyneError> {
        for max_in_memory in [1, 2] {
            let dir = std::env::temp_dir().join(format!(
                "graphyne-test-store-{}",
                max_in_memory
            ));
            let _ = fs::remove_dir_all(&dir);
            let store = PartitionStore::new_disk_backed(
                PartitionLayout::VertexMap,
                dir.clone(),
                max_in_memory,
            )?;
            check_read_write(&store)?;
            let _ = fs::remove_dir_all(&dir);
        }
        Ok(())
    }

    #[test]
    fn disk_store_spills_and_reloads() -> Result<(), GraphyneError> {
        let dir = std::env::temp_dir().join("graphyne-test-spill");
        let _ = fs::remove_dir_all(&dir);
        let store: PartitionStore<i32, i32, ()> =
            PartitionStore::new_disk_backed(
                PartitionLayout::VertexMap,
                dir.clone(),
                1,
            )?;
        store.add(partition(0, &[1, 2, 3]))?;
        store.add(partition(1, &[4]))?; // evicts partition 0

        assert!(dir.join("partition-0.bin").exists());
        let p0 = store.get(0)?.unwrap(); // loads back, evicts 1
        assert_eq!(p0.lock().vertex_count(), 3);
        drop(p0);
        assert!(dir.join("partition-1.bin").exists());

        store.delete(1)?;
        assert!(!dir.join("partition-1.bin").exists());
        assert_eq!(store.num_partitions(), 1);
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn merge_into_spilled_partition() -> Result<(), GraphyneError> {
        let dir = std::env::temp_dir().join("graphyne-test-merge-spill");
        let _ = fs::remove_dir_all(&dir);
        let store: PartitionStore<i32, i32, ()> =
            PartitionStore::new_disk_backed(
                PartitionLayout::VertexMap,
                dir.clone(),
                1,
            )?;
        store.add(partition(0, &[1]))?;
        store.add(partition(1, &[2]))?; // spills 0
        store.add(partition(0, &[3]))?; // loads 0 back and merges

        let p0 = store.get(0)?.unwrap();
        assert_eq!(p0.lock().vertex_count(), 2);
        drop(p0);
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
