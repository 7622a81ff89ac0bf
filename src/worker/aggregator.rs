//! Worker-side aggregator machinery: per-superstep partials folded locally,
//! shipped to owning workers at barrier time, merged, and verified against
//! the reserved request-count entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::graph::{
    AggregatorCatalog, AnyAggregator, RegisteredAggregator, WireData,
    WorkerId, COUNT_AGGREGATOR_NAME,
};
use crate::utils::GraphyneError;

/// One registered aggregator instance plus its persistence class.
#[derive(Clone)]
struct Instance {
    aggregator: Arc<dyn AnyAggregator>,
    persistent: bool,
}

/// A worker's view of the aggregator namespaces for the running superstep:
/// locally folded partials, plus the finalized values broadcast by the
/// master at superstep start.
pub struct WorkerAggregatorUsage {
    catalog: AggregatorCatalog,
    instances: RwLock<HashMap<String, Instance>>,

    /// Worker-local partials for the running superstep, merged per name.
    partials: DashMap<String, Vec<u8>>,

    /// Finalized values from the previous superstep.
    finalized: RwLock<HashMap<String, Vec<u8>>>,
}

impl WorkerAggregatorUsage {
    pub fn new(catalog: AggregatorCatalog) -> Self {
        WorkerAggregatorUsage {
            catalog,
            instances: RwLock::new(HashMap::new()),
            partials: DashMap::new(),
            finalized: RwLock::new(HashMap::new()),
        }
    }

    /// Installs the registration list broadcast by the master, instantiating
    /// through the catalog. Finalized values accompany the broadcast.
    pub fn configure(
        &self,
        registered: &[RegisteredAggregator],
        finalized: HashMap<String, Vec<u8>>,
    ) -> Result<(), GraphyneError> {
        let mut instances = self.instances.write();
        instances.clear();
        for reg in registered {
            instances.insert(
                reg.name.clone(),
                Instance {
                    aggregator: self.catalog.instantiate(&reg.kind)?,
                    persistent: reg.persistent,
                },
            );
        }
        *self.finalized.write() = finalized;
        self.partials.clear();
        Ok(())
    }

    fn instance(&self, name: &str) -> Result<Instance, GraphyneError> {
        self.instances.read().get(name).cloned().ok_or_else(|| {
            GraphyneError::msg(format!("aggregator '{}' not registered", name))
        })
    }

    /// Folds an encoded delta into the worker-local partial for `name`.
    /// Merging is serialized per aggregator name by the map entry.
    pub fn aggregate_bytes(
        &self,
        name: &str,
        delta: &[u8],
    ) -> Result<(), GraphyneError> {
        let instance = self.instance(name)?;
        match self.partials.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let combined = instance
                    .aggregator
                    .combine_bytes(entry.get(), delta)?;
                entry.insert(combined);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(delta.to_vec());
            }
        }
        Ok(())
    }

    /// Typed convenience over `aggregate_bytes`.
    pub fn aggregate<A: WireData>(
        &self,
        name: &str,
        delta: A,
    ) -> Result<(), GraphyneError> {
        self.aggregate_bytes(name, &delta.to_bytes())
    }

    /// Merges a thread-local scratch map produced by one compute work item.
    pub fn merge_scratch(
        &self,
        scratch: HashMap<String, Vec<u8>>,
    ) -> Result<(), GraphyneError> {
        for (name, bytes) in scratch {
            self.aggregate_bytes(&name, &bytes)?;
        }
        Ok(())
    }

    /// Drains the superstep's partials: one `(name, kind, bytes)` triple per
    /// aggregator that saw contributions.
    pub fn take_partials(
        &self,
    ) -> Result<Vec<(String, String, Vec<u8>)>, GraphyneError> {
        let mut out = Vec::new();
        let names: Vec<String> =
            self.partials.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((name, bytes)) = self.partials.remove(&name) {
                let instance = self.instance(&name)?;
                out.push((name, instance.aggregator.kind().to_string(), bytes));
            }
        }
        out.sort();
        Ok(out)
    }

    /// The finalized value of the previous superstep, decoded.
    pub fn aggregated<A: WireData>(
        &self,
        name: &str,
    ) -> Result<Option<A>, GraphyneError> {
        match self.finalized.read().get(name) {
            Some(bytes) => Ok(Some(A::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw finalized values, for checkpointing.
    pub fn finalized_values(&self) -> HashMap<String, Vec<u8>> {
        self.finalized.read().clone()
    }

    /// Names of the persistent-namespace aggregators.
    pub fn persistent_names(&self) -> Vec<String> {
        self.instances
            .read()
            .iter()
            .filter(|(_, inst)| inst.persistent)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Combines a thread-local scratch entry without touching the shared
    /// partials, for use inside compute work items.
    pub fn fold_into_scratch(
        &self,
        scratch: &mut HashMap<String, Vec<u8>>,
        name: &str,
        delta: &[u8],
    ) -> Result<(), GraphyneError> {
        let instance = self.instance(name)?;
        match scratch.get_mut(name) {
            Some(existing) => {
                *existing =
                    instance.aggregator.combine_bytes(existing, delta)?;
            }
            None => {
                scratch.insert(name.to_string(), delta.to_vec());
            }
        }
        Ok(())
    }
}

/// Owner-side aggregator state on the receiving worker: merged partials
/// arriving from peer workers, plus bookkeeping for the flow-control
/// verification carried by the reserved `"<COUNT>"` entry.
pub struct AggregatorServerData {
    catalog: AggregatorCatalog,

    /// Merged partials per aggregator name, with kind identifier.
    merged: DashMap<String, (String, Vec<u8>)>,

    /// Workers whose aggregator report for this superstep has arrived.
    reported: Mutex<HashSet<WorkerId>>,

    /// Announced request counts per reporting worker (from `"<COUNT>"`).
    announced_counts: DashMap<WorkerId, u64>,

    /// Requests actually handled per source worker this superstep.
    handled_counts: DashMap<WorkerId, u64>,

    notify: Notify,
}

impl AggregatorServerData {
    pub fn new(catalog: AggregatorCatalog) -> Self {
        AggregatorServerData {
            catalog,
            merged: DashMap::new(),
            reported: Mutex::new(HashSet::new()),
            announced_counts: DashMap::new(),
            handled_counts: DashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Counts one handled request from a source worker.
    pub fn count_handled_request(&self, source: WorkerId) {
        *self.handled_counts.entry(source).or_insert(0) += 1;
    }

    /// Applies one send-aggregators request from a peer worker. Entries are
    /// `(name, kind, value bytes)`; the reserved count entry carries the
    /// sender's request tally instead of an aggregator value.
    pub fn receive_from_worker(
        &self,
        source: WorkerId,
        entries: Vec<(String, String, Vec<u8>)>,
    ) -> Result<(), GraphyneError> {
        for (name, kind, bytes) in entries {
            if name == COUNT_AGGREGATOR_NAME {
                let count = u64::from_bytes(&bytes)?;
                self.announced_counts.insert(source, count);
                continue;
            }
            let aggregator = self.catalog.instantiate(&kind)?;
            match self.merged.entry(name) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    let combined =
                        aggregator.combine_bytes(&entry.get().1, &bytes)?;
                    entry.get_mut().1 = combined;
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert((kind, bytes));
                }
            }
        }
        self.reported.lock().insert(source);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until every worker in the population has reported.
    pub async fn wait_all_reports(&self, population: u32) {
        loop {
            if self.reported.lock().len() as u32 >= population {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before the re-check so a report landing
            // between the check and the await cannot be lost
            notified.as_mut().enable();
            if self.reported.lock().len() as u32 >= population {
                return;
            }
            notified.await;
        }
    }

    /// Verifies announced vs handled request counts, logging mismatches.
    pub fn verify_request_counts(&self) {
        for entry in self.announced_counts.iter() {
            let handled = self
                .handled_counts
                .get(entry.key())
                .map(|c| *c)
                .unwrap_or(0);
            if handled != *entry.value() {
                pf_warn!(
                    "aggr";
                    "worker {} announced {} requests, handled {}",
                    entry.key(),
                    entry.value(),
                    handled
                );
            }
        }
    }

    /// Drains the merged values and resets per-superstep bookkeeping.
    pub fn take_merged(&self) -> Vec<(String, String, Vec<u8>)> {
        let mut out: Vec<(String, String, Vec<u8>)> = Vec::new();
        let names: Vec<String> =
            self.merged.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((name, (kind, bytes))) = self.merged.remove(&name) {
                out.push((name, kind, bytes));
            }
        }
        out.sort();
        self.reported.lock().clear();
        self.announced_counts.clear();
        self.handled_counts.clear();
        out
    }
}

#[cfg(test)]
mod aggregator_tests {
    use super::*;

    fn registered(name: &str, kind: &str) -> RegisteredAggregator {
        RegisteredAggregator {
            name: name.into(),
            kind: kind.into(),
            persistent: false,
        }
    }

    #[test]
    fn partials_fold_per_name() -> Result<(), GraphyneError> {
        let usage =
            WorkerAggregatorUsage::new(AggregatorCatalog::with_builtins());
        usage.configure(
            &[registered("sum", "sum_i64"), registered("min", "min_i64")],
            HashMap::new(),
        )?;

        usage.aggregate("sum", 3i64)?;
        usage.aggregate("sum", 4i64)?;
        usage.aggregate("min", 9i64)?;
        usage.aggregate("min", 2i64)?;

        let partials = usage.take_partials()?;
        assert_eq!(partials.len(), 2);
        let sum = partials.iter().find(|(n, _, _)| n == "sum").unwrap();
        assert_eq!(i64::from_bytes(&sum.2)?, 7);
        let min = partials.iter().find(|(n, _, _)| n == "min").unwrap();
        assert_eq!(i64::from_bytes(&min.2)?, 2);

        // drained exactly once
        assert!(usage.take_partials()?.is_empty());
        Ok(())
    }

    #[test]
    fn unregistered_name_rejected() {
        let usage =
            WorkerAggregatorUsage::new(AggregatorCatalog::with_builtins());
        assert!(usage.aggregate("ghost", 1i64).is_err());
    }

    #[test]
    fn finalized_reads_previous_superstep() -> Result<(), GraphyneError> {
        let usage =
            WorkerAggregatorUsage::new(AggregatorCatalog::with_builtins());
        let mut finalized = HashMap::new();
        finalized.insert("sum".to_string(), 42i64.to_bytes());
        usage.configure(&[registered("sum", "sum_i64")], finalized)?;

        assert_eq!(usage.aggregated::<i64>("sum")?, Some(42));
        assert_eq!(usage.aggregated::<i64>("other")?, None);
        Ok(())
    }

    #[test]
    fn owner_merges_across_workers() -> Result<(), GraphyneError> {
        let data =
            AggregatorServerData::new(AggregatorCatalog::with_builtins());
        data.receive_from_worker(
            0,
            vec![
                ("sum".into(), "sum_i64".into(), 10i64.to_bytes()),
                (
                    COUNT_AGGREGATOR_NAME.into(),
                    "count_u64".into(),
                    0u64.to_bytes(),
                ),
            ],
        )?;
        data.receive_from_worker(
            1,
            vec![("sum".into(), "sum_i64".into(), 32i64.to_bytes())],
        )?;

        let merged = data.take_merged();
        assert_eq!(merged.len(), 1);
        assert_eq!(i64::from_bytes(&merged[0].2)?, 42);
        Ok(())
    }

    #[tokio::test]
    async fn wait_all_reports_unblocks() -> Result<(), GraphyneError> {
        let data = Arc::new(AggregatorServerData::new(
            AggregatorCatalog::with_builtins(),
        ));
        let data2 = data.clone();
        let waiter =
            tokio::spawn(async move { data2.wait_all_reports(2).await });

        data.receive_from_worker(0, vec![])?;
        data.receive_from_worker(1, vec![])?;
        waiter.await?;
        Ok(())
    }
}
