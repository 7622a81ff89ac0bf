//! The job master: waits for workers to register, assigns partitions,
//! publishes input splits, collects barrier stats, finalizes aggregators,
//! and decides when the job terminates.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::comm::PartitionOwner;
use crate::coord::{BarrierHandle, CoordService, SessionId};
use crate::graph::{
    AggregatorCatalog, RegisteredAggregator, SuperstepId, VertexId, WireData,
    WorkerId, INPUT_SUPERSTEP,
};
use crate::io::{EdgeInputFormat, VertexInputFormat};
use crate::program::MasterObserver;
use crate::utils::{Bitmap, GraphyneError};
use crate::worker::{
    cleanup_checkpoints, read_checkpoint, JobSetupBlob, SuperstepDecision,
    WorkerStats,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Number of workers in the job.
    pub population: u32,

    /// Number of partitions the graph is hashed into.
    pub num_partitions: u32,

    /// Desired number of input splits per input format.
    pub num_splits: u32,

    /// Checkpoint every C supersteps; 0 disables checkpointing.
    pub checkpoint_frequency: u32,

    /// Root directory for checkpoints.
    pub checkpoint_directory: String,

    /// Remove checkpoints after a successful run.
    pub cleanup_checkpoints_after_success: bool,

    /// Restart from this checkpoint superstep; negative disables.
    pub restart_superstep: i64,

    /// Safety valve on runaway jobs.
    pub max_supersteps: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            population: 1,
            num_partitions: 4,
            num_splits: 4,
            checkpoint_frequency: 0,
            checkpoint_directory: "/tmp/graphyne.ckpt".into(),
            cleanup_checkpoints_after_success: false,
            restart_superstep: -1,
            max_supersteps: 1_000_000,
        }
    }
}

impl JobConfig {
    /// Parses a config from an optional TOML overlay string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, GraphyneError> {
        parsed_config!(config_str => JobConfig;
                       population, num_partitions, num_splits,
                       checkpoint_frequency, checkpoint_directory,
                       cleanup_checkpoints_after_success, restart_superstep,
                       max_supersteps)
    }

    fn restart(&self) -> Option<SuperstepId> {
        (self.restart_superstep >= 0).then_some(self.restart_superstep)
    }
}

/// What a finished job reports back.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Compute supersteps executed (input superstep excluded).
    pub supersteps: i64,

    pub total_vertices: u64,
    pub total_edges: u64,

    /// Final aggregator values.
    pub finalized: HashMap<String, Vec<u8>>,
}

impl JobOutcome {
    /// Decodes a final aggregator value.
    pub fn aggregated<A: WireData>(
        &self,
        name: &str,
    ) -> Result<Option<A>, GraphyneError> {
        match self.finalized.get(name) {
            Some(bytes) => Ok(Some(A::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }
}

/// The master runtime for one job.
pub struct GraphMaster<I, V, E, M> {
    config: JobConfig,
    coord: Arc<dyn CoordService>,
    session: SessionId,
    barrier: BarrierHandle,

    catalog: AggregatorCatalog,
    registered: Vec<RegisteredAggregator>,
    observers: Vec<Arc<dyn MasterObserver>>,

    vertex_input: Arc<dyn VertexInputFormat<I, V, E>>,
    edge_input: Option<Arc<dyn EdgeInputFormat<I, E>>>,

    /// Accumulated values of the persistent aggregator namespace.
    persistent_state: HashMap<String, Vec<u8>>,

    _marker: PhantomData<fn() -> M>,
}

impl<I, V, E, M> GraphMaster<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        config: JobConfig,
        coord: Arc<dyn CoordService>,
        catalog: AggregatorCatalog,
        registered: Vec<RegisteredAggregator>,
        observers: Vec<Arc<dyn MasterObserver>>,
        vertex_input: Arc<dyn VertexInputFormat<I, V, E>>,
        edge_input: Option<Arc<dyn EdgeInputFormat<I, E>>>,
    ) -> Result<Self, GraphyneError> {
        if config.population == 0 {
            return Err(GraphyneError::msg("population must be >= 1"));
        }
        if config.num_partitions == 0 {
            return Err(GraphyneError::msg("num_partitions must be >= 1"));
        }
        let session = coord.new_session().await?;
        let barrier = BarrierHandle::new(coord.clone(), session);
        Ok(GraphMaster {
            config,
            coord,
            session,
            barrier,
            catalog,
            registered,
            observers,
            vertex_input,
            edge_input,
            persistent_state: HashMap::new(),
            _marker: PhantomData,
        })
    }

    /// Runs the job from worker registration to termination.
    pub async fn run(&mut self) -> Result<JobOutcome, GraphyneError> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            pf_error!("master"; "job failed: {}", e);
            let _ = self.barrier.signal_abort(&e.to_string()).await;
        }
        let _ = self.coord.end_session(self.session).await;
        result
    }

    async fn run_inner(&mut self) -> Result<JobOutcome, GraphyneError> {
        for observer in &self.observers {
            observer.pre_application();
        }

        // wait for the full worker population to register, then bind
        // partitions to workers
        let workers = self.await_workers().await?;
        let owners = self.assign_partitions(&workers);

        // publish input splits
        let restart = self.config.restart();
        let (num_vertex_splits, num_edge_splits) = if restart.is_none() {
            self.publish_splits().await?
        } else {
            (0, 0)
        };

        if let Some(superstep) = restart {
            // recover the persistent aggregator namespace from the
            // checkpoint the workers will restore
            let file = read_checkpoint(
                Path::new(&self.config.checkpoint_directory),
                superstep,
                workers[0].0,
            )
            .await?;
            for reg in &self.registered {
                if reg.persistent {
                    if let Some(bytes) = file.finalized.get(&reg.name) {
                        self.persistent_state
                            .insert(reg.name.clone(), bytes.clone());
                    }
                }
            }
            pf_info!(
                "master";
                "restarting job from checkpoint superstep {}",
                superstep
            );
        }

        let first_superstep = restart.unwrap_or(INPUT_SUPERSTEP);
        for observer in &self.observers {
            observer.pre_superstep(first_superstep);
        }

        let setup = JobSetupBlob {
            population: self.config.population,
            owners: owners.clone(),
            registered: self.registered.clone(),
            num_vertex_splits,
            num_edge_splits,
            restart_superstep: restart,
        };
        self.coord
            .create_persistent(
                "/job/setup",
                rmp_serde::encode::to_vec(&setup)?,
            )
            .await?;

        // superstep loop
        let mut superstep = first_superstep;
        let outcome;
        loop {
            let stats = self.collect_stats(superstep).await?;
            let active: u64 =
                stats.iter().map(|s| s.active_vertices).sum();
            let messages: u64 = stats.iter().map(|s| s.messages_sent).sum();
            let total_vertices: u64 =
                stats.iter().map(|s| s.total_vertices).sum();
            let total_edges: u64 = stats.iter().map(|s| s.total_edges).sum();
            let finalized = self.finalize_aggregators(&stats)?;
            pf_debug!(
                "master";
                "superstep {} done: {} active, {} messages",
                superstep,
                active,
                messages
            );

            for observer in &self.observers {
                observer.post_superstep(superstep);
            }

            if (active == 0 && messages == 0)
                || superstep >= self.config.max_supersteps
            {
                self.barrier
                    .publish_decision(
                        superstep,
                        rmp_serde::encode::to_vec(
                            &SuperstepDecision::Terminate {
                                finalized: finalized.clone(),
                            },
                        )?,
                    )
                    .await?;
                outcome = JobOutcome {
                    supersteps: superstep + 1,
                    total_vertices,
                    total_edges,
                    finalized,
                };
                break;
            }

            let checkpoint = self.config.checkpoint_frequency > 0
                && (superstep + 1)
                    % i64::from(self.config.checkpoint_frequency)
                    == 0;
            for observer in &self.observers {
                observer.pre_superstep(superstep + 1);
            }
            self.barrier
                .publish_decision(
                    superstep,
                    rmp_serde::encode::to_vec(
                        &SuperstepDecision::Continue {
                            owners: owners.clone(),
                            registered: self.registered.clone(),
                            finalized,
                            total_vertices,
                            total_edges,
                            checkpoint,
                        },
                    )?,
                )
                .await?;
            superstep += 1;
        }

        for observer in &self.observers {
            observer.post_application();
        }

        if self.config.cleanup_checkpoints_after_success {
            cleanup_checkpoints(Path::new(&self.config.checkpoint_directory))
                .await?;
        }

        Ok(outcome)
    }

    /// Waits for `population` workers to register, returning their ids and
    /// request addresses.
    async fn await_workers(
        &self,
    ) -> Result<Vec<(WorkerId, SocketAddr)>, GraphyneError> {
        let mut watch = self.coord.watch("/workers/").await?;
        loop {
            let paths = self.coord.list("/workers/").await?;
            if paths.len() as u32 >= self.config.population {
                let mut workers = Vec::with_capacity(paths.len());
                for path in paths {
                    let id: WorkerId = path
                        .rsplit('/')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            GraphyneError::CoordinationLost(format!(
                                "malformed worker node '{}'",
                                path
                            ))
                        })?;
                    let blob =
                        self.coord.read(&path).await?.ok_or_else(|| {
                            GraphyneError::CoordinationLost(format!(
                                "worker node '{}' vanished",
                                path
                            ))
                        })?;
                    let addr: SocketAddr =
                        rmp_serde::decode::from_slice(&blob)?;
                    workers.push((id, addr));
                }
                workers.sort_by_key(|(id, _)| *id);
                pf_info!("master"; "{} workers registered", workers.len());
                return Ok(workers);
            }
            watch.changed().await?;
        }
    }

    /// Binds every partition id to a worker, round-robin.
    fn assign_partitions(
        &self,
        workers: &[(WorkerId, SocketAddr)],
    ) -> Vec<PartitionOwner> {
        (0..self.config.num_partitions)
            .map(|partition| {
                let (worker, addr) =
                    workers[partition as usize % workers.len()];
                PartitionOwner {
                    partition,
                    worker,
                    addr,
                }
            })
            .collect()
    }

    /// Publishes split descriptor nodes for both input formats.
    async fn publish_splits(&self) -> Result<(u32, u32), GraphyneError> {
        let vsplits =
            self.vertex_input.splits(self.config.num_splits as usize)?;
        for (i, descriptor) in vsplits.iter().enumerate() {
            self.coord
                .create_persistent(
                    &format!("/vsplit/data-{}", i),
                    descriptor.clone(),
                )
                .await?;
        }

        let mut num_edge_splits = 0u32;
        if let Some(edge_input) = &self.edge_input {
            let esplits =
                edge_input.splits(self.config.num_splits as usize)?;
            for (i, descriptor) in esplits.iter().enumerate() {
                self.coord
                    .create_persistent(
                        &format!("/esplit/data-{}", i),
                        descriptor.clone(),
                    )
                    .await?;
            }
            num_edge_splits = esplits.len() as u32;
        }
        Ok((vsplits.len() as u32, num_edge_splits))
    }

    /// Collects every worker's barrier stats, aborting early on a job
    /// abort.
    async fn collect_stats(
        &self,
        superstep: SuperstepId,
    ) -> Result<Vec<WorkerStats>, GraphyneError> {
        let mut abort_watch = self.coord.watch("/job/abort").await?;
        if let Some(cause) = self.barrier.aborted().await? {
            return Err(GraphyneError::CoordinationLost(format!(
                "job aborted: {}",
                cause
            )));
        }
        let entries = tokio::select! {
            entries = self
                .barrier
                .collect(superstep, self.config.population) => entries?,
            _ = abort_watch.changed() => {
                let cause = self
                    .barrier
                    .aborted()
                    .await?
                    .unwrap_or_else(|| "unknown".into());
                return Err(GraphyneError::CoordinationLost(format!(
                    "job aborted: {}",
                    cause
                )));
            },
        };
        let stats: Vec<WorkerStats> = entries
            .into_iter()
            .map(|(_, blob)| {
                rmp_serde::decode::from_slice(&blob)
                    .map_err(GraphyneError::from)
            })
            .collect::<Result<_, _>>()?;

        // every worker id must appear exactly once
        let mut seen = Bitmap::new(self.config.population, false);
        for worker_stats in &stats {
            seen.set(worker_stats.worker, true)?;
        }
        if seen.count() != self.config.population {
            return Err(GraphyneError::ProtocolViolation(format!(
                "barrier {} entries cover workers {:?} of population {}",
                superstep, seen, self.config.population
            )));
        }
        Ok(stats)
    }

    /// Combines owner-merged values across workers and produces the
    /// finalized map for the next superstep: regular aggregators reset to
    /// the superstep's contributions, persistent ones accumulate.
    fn finalize_aggregators(
        &mut self,
        stats: &[WorkerStats],
    ) -> Result<HashMap<String, Vec<u8>>, GraphyneError> {
        let mut merged: HashMap<String, (String, Vec<u8>)> = HashMap::new();
        for worker_stats in stats {
            for (name, kind, bytes) in &worker_stats.merged_aggregators {
                match merged.get_mut(name) {
                    Some((_, existing)) => {
                        let aggregator = self.catalog.instantiate(kind)?;
                        *existing =
                            aggregator.combine_bytes(existing, bytes)?;
                    }
                    None => {
                        merged.insert(
                            name.clone(),
                            (kind.clone(), bytes.clone()),
                        );
                    }
                }
            }
        }

        let mut finalized = HashMap::new();
        for reg in &self.registered {
            let aggregator = self.catalog.instantiate(&reg.kind)?;
            let contribution = merged.get(&reg.name).map(|(_, b)| b);
            let value = if reg.persistent {
                let state = self
                    .persistent_state
                    .entry(reg.name.clone())
                    .or_insert_with(|| aggregator.initial_bytes());
                if let Some(bytes) = contribution {
                    *state = aggregator.combine_bytes(state, bytes)?;
                }
                state.clone()
            } else {
                match contribution {
                    Some(bytes) => bytes.clone(),
                    None => aggregator.initial_bytes(),
                }
            };
            finalized.insert(reg.name.clone(), value);
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod master_tests {
    use super::*;

    #[test]
    fn config_overlay_and_restart() {
        let config = JobConfig::from_config_str(Some(
            "population = 2\ncheckpoint_frequency = 1\nrestart_superstep = 3",
        ))
        .unwrap();
        assert_eq!(config.population, 2);
        assert_eq!(config.restart(), Some(3));

        let config = JobConfig::from_config_str(None).unwrap();
        assert_eq!(config.restart(), None);
    }

    #[test]
    fn partition_assignment_round_robin() {
        let config = JobConfig {
            num_partitions: 5,
            population: 2,
            ..Default::default()
        };
        let master_config = config;
        let workers = vec![
            (0u32, "127.0.0.1:7000".parse().unwrap()),
            (1u32, "127.0.0.1:7001".parse().unwrap()),
        ];
        // assignment logic only depends on the config and worker list
        let owners: Vec<PartitionOwner> = (0..master_config.num_partitions)
            .map(|partition| {
                let (worker, addr) =
                    workers[partition as usize % workers.len()];
                PartitionOwner {
                    partition,
                    worker,
                    addr,
                }
            })
            .collect();
        assert_eq!(owners.len(), 5);
        assert_eq!(owners[0].worker, 0);
        assert_eq!(owners[1].worker, 1);
        assert_eq!(owners[4].worker, 0);
    }
}
