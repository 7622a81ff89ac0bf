//! The graph worker runtime: owns this worker's share of the graph and the
//! communication hubs, and drives the superstep state machine from input
//! loading through termination.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::comm::{
    OutboundItem, RequestClient, RequestProcessor, RequestServer,
    WorkerRequest,
};
use crate::coord::{BarrierHandle, CoordService, SessionId};
use crate::graph::{
    AggregatorCatalog, Partition, PartitionId, PartitionLayout, SuperstepId,
    TypeSuite, VertexId, WireData, WorkerId, COUNT_AGGREGATOR_NAME,
    INPUT_SUPERSTEP,
};
use crate::io::{EdgeInputFormat, VertexInputFormat, VertexOutputFormat};
use crate::metrics::WorkerMetrics;
use crate::program::VertexProgram;
use crate::utils::GraphyneError;
use crate::worker::aggregator::WorkerAggregatorUsage;
use crate::worker::compute::ComputePool;
use crate::worker::server_data::{ServerData, SharedServerData};
use crate::worker::superstep::{
    JobSetupBlob, SuperstepDecision, SuperstepState, WorkerStats,
};
use crate::worker::{read_checkpoint, write_checkpoint, CheckpointFile};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Compute thread pool size.
    pub compute_threads: usize,

    /// Choose the disk-backed partition store.
    pub use_out_of_core_graph: bool,

    /// Resident partition cap of the disk-backed store.
    pub max_partitions_in_memory: usize,

    /// Choose the serialized byte-array partition layout.
    pub use_byte_array_partitions: bool,

    /// Directory for partition spill files.
    pub spill_directory: String,

    /// Root directory for checkpoints.
    pub checkpoint_directory: String,

    /// Soft byte threshold for request batching.
    pub request_batch_bytes: usize,

    /// Base acknowledgement timeout in millisecs before retransmission.
    pub request_timeout_ms: u64,

    /// Attempts per request before a peer is declared unreachable.
    pub max_request_attempts: u32,

    /// Outstanding-request window per peer.
    pub max_outstanding_requests_per_peer: usize,

    /// Whether a message to an absent vertex materializes it.
    pub resolver_create_vertex_on_messages: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            compute_threads: 4,
            use_out_of_core_graph: false,
            max_partitions_in_memory: 16,
            use_byte_array_partitions: false,
            spill_directory: "/tmp/graphyne.spill".into(),
            checkpoint_directory: "/tmp/graphyne.ckpt".into(),
            request_batch_bytes: 64 * 1024,
            request_timeout_ms: 2000,
            max_request_attempts: 5,
            max_outstanding_requests_per_peer: 64,
            resolver_create_vertex_on_messages: true,
        }
    }
}

impl WorkerConfig {
    /// Parses a config from an optional TOML overlay string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, GraphyneError> {
        parsed_config!(config_str => WorkerConfig;
                       compute_threads, use_out_of_core_graph,
                       max_partitions_in_memory, use_byte_array_partitions,
                       spill_directory, checkpoint_directory,
                       request_batch_bytes, request_timeout_ms,
                       max_request_attempts,
                       max_outstanding_requests_per_peer,
                       resolver_create_vertex_on_messages)
    }
}

/// The per-worker slice of a job: user program, type capabilities, and
/// format drivers. Cloning shares the underlying objects.
pub struct WorkerHarness<I, V, E, M> {
    pub program: Arc<dyn VertexProgram<I, V, E, M>>,
    pub types: TypeSuite<I, V, E, M>,
    pub catalog: AggregatorCatalog,
    pub vertex_input: Arc<dyn VertexInputFormat<I, V, E>>,
    pub edge_input: Option<Arc<dyn EdgeInputFormat<I, E>>>,
    pub output: Option<Arc<dyn VertexOutputFormat<I, V, E>>>,
    pub config: WorkerConfig,
}

impl<I, V, E, M> Clone for WorkerHarness<I, V, E, M> {
    fn clone(&self) -> Self {
        WorkerHarness {
            program: self.program.clone(),
            types: self.types.clone(),
            catalog: self.catalog.clone(),
            vertex_input: self.vertex_input.clone(),
            edge_input: self.edge_input.clone(),
            output: self.output.clone(),
            config: self.config.clone(),
        }
    }
}

/// One worker's runtime.
pub struct GraphWorker<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    /// My worker ID.
    me: WorkerId,

    harness: WorkerHarness<I, V, E, M>,

    coord: Arc<dyn CoordService>,
    session: SessionId,
    barrier: BarrierHandle,

    server: RequestServer<I, V, E, M>,
    client: Arc<RequestClient<I, V, E, M>>,
    server_data: SharedServerData<I, V, E, M>,
    processor: Arc<RequestProcessor<I, V, E, M>>,
    aggregators: Arc<WorkerAggregatorUsage>,
    compute_pool: Arc<ComputePool>,

    metrics: Arc<WorkerMetrics>,

    /// Fatal errors from the hubs (client retries exhausted, server
    /// protocol violations, dispatcher failures).
    rx_error: mpsc::UnboundedReceiver<GraphyneError>,

    state: SuperstepState,
    population: u32,
    /// Global graph totals as of the previous barrier.
    totals: (u64, u64),
}

impl<I, V, E, M> GraphWorker<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    /// Creates a new worker runtime and sets up its functionality modules:
    /// server data, request server/client/processor with its dispatcher
    /// task, aggregator usage, and the compute pool.
    pub async fn new_and_setup(
        me: WorkerId,
        bind_addr: SocketAddr,
        coord: Arc<dyn CoordService>,
        mut harness: WorkerHarness<I, V, E, M>,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self, GraphyneError> {
        let config = harness.config.clone();
        harness.types.create_vertex_on_messages =
            config.resolver_create_vertex_on_messages;

        let layout = if config.use_byte_array_partitions {
            PartitionLayout::ByteArray
        } else {
            PartitionLayout::VertexMap
        };
        let spill = if config.use_out_of_core_graph {
            Some((
                PathBuf::from(&config.spill_directory)
                    .join(format!("worker-{}", me)),
                config.max_partitions_in_memory,
            ))
        } else {
            None
        };

        let server_data: SharedServerData<I, V, E, M> =
            Arc::new(ServerData::new(
                &harness.types,
                layout,
                harness.catalog.clone(),
                spill,
            )?);

        let (tx_error, rx_error) = mpsc::unbounded_channel();

        let server = RequestServer::new_and_setup(
            me,
            bind_addr,
            server_data.clone(),
            tx_error.clone(),
        )
        .await?;

        let client = Arc::new(RequestClient::new(
            me,
            config.max_outstanding_requests_per_peer,
            Duration::from_millis(config.request_timeout_ms),
            config.max_request_attempts,
            tx_error.clone(),
        ));

        let (tx_out, rx_out) = mpsc::channel(256);
        let processor = Arc::new(RequestProcessor::new(
            me,
            server_data.clone(),
            tx_out,
            config.request_batch_bytes,
        ));
        tokio::spawn(Self::dispatcher_task(
            rx_out,
            client.clone(),
            tx_error.clone(),
        ));

        let aggregators = Arc::new(WorkerAggregatorUsage::new(
            harness.catalog.clone(),
        ));
        let compute_pool =
            Arc::new(ComputePool::new(config.compute_threads)?);

        let session = coord.new_session().await?;
        let barrier = BarrierHandle::new(coord.clone(), session);

        Ok(GraphWorker {
            me,
            harness,
            coord,
            session,
            barrier,
            server,
            client,
            server_data,
            processor,
            aggregators,
            compute_pool,
            metrics,
            rx_error,
            state: SuperstepState::Setup,
            population: 0,
            totals: (0, 0),
        })
    }

    /// The address peers send requests to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Current superstep state, for observability.
    pub fn state(&self) -> SuperstepState {
        self.state
    }

    /// Dispatcher task: feeds processor output into the request client,
    /// resolving flush points once the outstanding window drains.
    async fn dispatcher_task(
        mut rx_out: mpsc::Receiver<OutboundItem<I, V, E, M>>,
        client: Arc<RequestClient<I, V, E, M>>,
        tx_error: mpsc::UnboundedSender<GraphyneError>,
    ) {
        while let Some(item) = rx_out.recv().await {
            match item {
                OutboundItem::Request(dest, request) => {
                    if let Err(e) = client.send_request(dest, request).await {
                        let _ = tx_error.send(e);
                    }
                }
                OutboundItem::FlushPoint(done) => {
                    if let Err(e) = client.wait_all_requests().await {
                        let _ = tx_error.send(e);
                    }
                    let _ = done.send(());
                }
            }
        }
    }

    /// Runs the job to completion (or failure). On failure the abort node
    /// is published so peers stop waiting at barriers.
    pub async fn run(&mut self) -> Result<(), GraphyneError> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            pf_error!(self.me; "worker failed: {}", e);
            let _ = self.barrier.signal_abort(&e.to_string()).await;
            self.state = SuperstepState::Terminate;
        }
        let _ = self.coord.end_session(self.session).await;
        result
    }

    async fn run_inner(&mut self) -> Result<(), GraphyneError> {
        // SETUP: register with the master and wait for the job setup blob
        self.state = SuperstepState::Setup;
        let addr_blob = rmp_serde::encode::to_vec(&self.rpc_addr())?;
        let registered = self
            .coord
            .create_ephemeral(
                self.session,
                &format!("/workers/{}", self.me),
                addr_blob,
            )
            .await?;
        if !registered {
            return Err(GraphyneError::CoordinationLost(format!(
                "worker id {} already registered",
                self.me
            )));
        }

        let setup: JobSetupBlob = {
            let blob = self.await_node("/job/setup").await?;
            rmp_serde::decode::from_slice(&blob)?
        };
        self.population = setup.population;
        self.processor.set_owners(setup.owners.clone());
        self.connect_peers().await?;

        let mut superstep = match setup.restart_superstep {
            None => {
                self.aggregators.configure(&setup.registered, HashMap::new())?;

                // INPUT_SPLITS + VERTEX_EXCHANGE
                self.state = SuperstepState::InputSplits;
                let (vertices_read, edges_read) =
                    self.load_input(&setup).await?;
                self.state = SuperstepState::VertexExchange;
                self.flush_requests().await?;
                self.ship_aggregators().await?;

                let stats = WorkerStats {
                    worker: self.me,
                    active_vertices: vertices_read,
                    total_vertices: vertices_read,
                    total_edges: edges_read,
                    messages_sent: 0,
                    merged_aggregators: self
                        .collect_owner_aggregators()
                        .await?,
                };
                match self.barrier_round(INPUT_SUPERSTEP, stats).await? {
                    SuperstepDecision::Continue { .. } => {}
                    SuperstepDecision::Terminate { .. } => {
                        self.state = SuperstepState::Terminate;
                        self.write_output().await?;
                        return Ok(());
                    }
                }
                0
            }
            Some(restart) => {
                self.restore_checkpoint(&setup, restart).await?;
                restart
            }
        };

        // compute superstep loop
        loop {
            self.drain_errors()?;

            self.state = SuperstepState::Compute;
            let pass = self.compute_superstep(superstep).await?;
            self.metrics.add_supersteps(1);
            self.metrics.add_vertices_computed(pass.computed_vertices);

            self.state = SuperstepState::FlushRequests;
            self.flush_requests().await?;
            self.ship_aggregators().await?;

            self.state = SuperstepState::Barrier;
            let messages_sent = self.processor.reset_message_count();
            self.metrics.add_messages_sent(messages_sent);
            let stats = WorkerStats {
                worker: self.me,
                active_vertices: pass.active_vertices,
                total_vertices: pass.total_vertices,
                total_edges: pass.total_edges,
                messages_sent,
                merged_aggregators: self.collect_owner_aggregators().await?,
            };

            match self.barrier_round(superstep, stats).await? {
                SuperstepDecision::Continue { .. } => {
                    self.state = SuperstepState::NextSuperstep;
                    superstep += 1;
                }
                SuperstepDecision::Terminate { .. } => {
                    self.state = SuperstepState::Terminate;
                    self.write_output().await?;
                    return Ok(());
                }
            }
        }
    }

    /// One barrier round: enter with stats, wait for the master's decision,
    /// and apply it (mutations, message roll, aggregator finalization,
    /// checkpoint). Returns the decision.
    async fn barrier_round(
        &mut self,
        superstep: SuperstepId,
        stats: WorkerStats,
    ) -> Result<SuperstepDecision, GraphyneError> {
        let blob = rmp_serde::encode::to_vec(&stats)?;
        self.barrier.enter(superstep, self.me, blob).await?;
        let decision: SuperstepDecision = {
            let blob = self.await_decision_or_abort(superstep).await?;
            rmp_serde::decode::from_slice(&blob)?
        };

        if let SuperstepDecision::Continue {
            owners,
            registered,
            finalized,
            total_vertices,
            total_edges,
            checkpoint,
        } = &decision
        {
            self.processor.set_owners(owners.clone());
            self.connect_peers().await?;

            // ROLL_MESSAGES: the inbox written this superstep freezes and
            // becomes readable; APPLY_MUTATIONS resolves against it
            self.state = SuperstepState::RollMessages;
            self.server_data.message_store.swap();

            self.state = SuperstepState::ApplyMutations;
            self.apply_mutations().await?;

            self.state = SuperstepState::FinalizeAggregators;
            self.aggregators.configure(registered, finalized.clone())?;
            self.totals = (*total_vertices, *total_edges);

            if *checkpoint {
                self.checkpoint(superstep + 1).await;
            }
        } else if let SuperstepDecision::Terminate { finalized } = &decision {
            // final values stay readable after termination; the instance
            // table is no longer needed
            self.aggregators.configure(&[], finalized.clone())?;
        }
        Ok(decision)
    }

    async fn connect_peers(&self) -> Result<(), GraphyneError> {
        for (worker, addr) in self.processor.all_workers() {
            if worker != self.me && !self.client.has_peer(worker) {
                self.client.connect_to_peer(worker, addr).await?;
            }
        }
        Ok(())
    }

    /// Waits for a coordination node to appear.
    async fn await_node(
        &self,
        path: &str,
    ) -> Result<Vec<u8>, GraphyneError> {
        let mut watch = self.coord.watch(path).await?;
        loop {
            if let Some(blob) = self.coord.read(path).await? {
                return Ok(blob);
            }
            watch.changed().await?;
        }
    }

    /// Waits for the superstep decision, aborting early on a fatal hub
    /// error or a job abort signalled by a peer.
    async fn await_decision_or_abort(
        &mut self,
        superstep: SuperstepId,
    ) -> Result<Vec<u8>, GraphyneError> {
        let mut abort_watch = self.coord.watch("/job/abort").await?;
        if let Some(cause) = self.barrier.aborted().await? {
            return Err(GraphyneError::CoordinationLost(format!(
                "job aborted: {}",
                cause
            )));
        }
        tokio::select! {
            decision = self.barrier.await_decision(superstep) => decision,
            _ = abort_watch.changed() => {
                let cause = self
                    .barrier
                    .aborted()
                    .await?
                    .unwrap_or_else(|| "unknown".into());
                Err(GraphyneError::CoordinationLost(format!(
                    "job aborted: {}",
                    cause
                )))
            },
            err = self.rx_error.recv() => {
                Err(err.unwrap_or_else(|| {
                    GraphyneError::msg("error channel closed")
                }))
            },
        }
    }

    fn drain_errors(&mut self) -> Result<(), GraphyneError> {
        match self.rx_error.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// INPUT_SPLITS: claims splits through the coordination service, reads
    /// them, and routes vertices and edges to their owners. Returns the
    /// counts read by this worker.
    async fn load_input(
        &self,
        setup: &JobSetupBlob,
    ) -> Result<(u64, u64), GraphyneError> {
        let mut vertices_read = 0u64;
        let mut edges_read = 0u64;

        for i in 0..setup.num_vertex_splits {
            let claim = format!("/vsplit/reserved-{}", i);
            if !self
                .coord
                .create_ephemeral(self.session, &claim, Vec::new())
                .await?
            {
                continue; // another worker holds this split
            }
            let descriptor = self
                .coord
                .read(&format!("/vsplit/data-{}", i))
                .await?
                .ok_or_else(|| {
                    GraphyneError::CoordinationLost(format!(
                        "vertex split {} descriptor missing",
                        i
                    ))
                })?;

            let input = self.harness.vertex_input.clone();
            let processor = self.processor.clone();
            let (v, e) = tokio::task::spawn_blocking(move || {
                read_vertex_split(&*input, &processor, &descriptor)
            })
            .await??;
            vertices_read += v;
            edges_read += e;

            self.coord
                .create_persistent(&format!("/vsplit/finished-{}", i), Vec::new())
                .await?;
            pf_debug!(self.me; "finished vertex split {}", i);
        }

        if let Some(edge_input) = &self.harness.edge_input {
            for i in 0..setup.num_edge_splits {
                let claim = format!("/esplit/reserved-{}", i);
                if !self
                    .coord
                    .create_ephemeral(self.session, &claim, Vec::new())
                    .await?
                {
                    continue;
                }
                let descriptor = self
                    .coord
                    .read(&format!("/esplit/data-{}", i))
                    .await?
                    .ok_or_else(|| {
                        GraphyneError::CoordinationLost(format!(
                            "edge split {} descriptor missing",
                            i
                        ))
                    })?;

                let input = edge_input.clone();
                let processor = self.processor.clone();
                let count = tokio::task::spawn_blocking(move || {
                    read_edge_split(&*input, &processor, &descriptor)
                })
                .await??;
                edges_read += count;

                self.coord
                    .create_persistent(
                        &format!("/esplit/finished-{}", i),
                        Vec::new(),
                    )
                    .await?;
                pf_debug!(self.me; "finished edge split {}", i);
            }
        }

        Ok((vertices_read, edges_read))
    }

    /// COMPUTE: runs the user program over owned partitions on the pool.
    async fn compute_superstep(
        &self,
        superstep: SuperstepId,
    ) -> Result<crate::worker::ComputePassStats, GraphyneError> {
        let partitions = self.processor.my_partitions();
        let (total_vertices, total_edges) = self.totals;
        let pool = self.compute_pool.clone();
        let server_data = self.server_data.clone();
        let processor = self.processor.clone();
        let aggregators = self.aggregators.clone();
        let program = self.harness.program.clone();

        tokio::task::spawn_blocking(move || {
            pool.run_superstep(
                superstep,
                total_vertices,
                total_edges,
                &partitions,
                &server_data,
                &processor,
                &aggregators,
                &program,
            )
        })
        .await?
    }

    /// FLUSH_REQUESTS: drains batch buffers, sends an explicit flush point
    /// to every peer, and waits until everything is acknowledged.
    async fn flush_requests(&self) -> Result<(), GraphyneError> {
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || processor.flush()).await??;

        for (worker, _) in self.processor.all_workers() {
            if worker != self.me {
                self.client.send_request(worker, WorkerRequest::Flush).await?;
            }
        }
        self.processor.flush_and_wait().await
    }

    /// Ships one aggregator report to every worker: the partials for names
    /// that worker owns, plus the reserved request-count entry.
    async fn ship_aggregators(&self) -> Result<(), GraphyneError> {
        let partials = self.aggregators.take_partials()?;
        let mut per_owner: HashMap<WorkerId, Vec<(String, String, Vec<u8>)>> =
            HashMap::new();
        for worker in 0..self.population {
            per_owner.insert(worker, Vec::new());
        }
        for (name, kind, bytes) in partials {
            let owner = aggregator_owner(&name, self.population);
            per_owner.entry(owner).or_default().push((name, kind, bytes));
        }

        let sent_counts = self.client.take_sent_counts();
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GraphyneError> {
            for (worker, mut entries) in per_owner {
                let count =
                    sent_counts.get(&worker).copied().unwrap_or(0);
                entries.push((
                    COUNT_AGGREGATOR_NAME.to_string(),
                    "count_u64".to_string(),
                    count.to_bytes(),
                ));
                processor.send_aggregators(worker, entries)?;
            }
            Ok(())
        })
        .await??;
        self.processor.flush_and_wait().await
    }

    /// Owner side: waits for every worker's aggregator report, verifies
    /// the announced request counts, and drains the merged values.
    async fn collect_owner_aggregators(
        &self,
    ) -> Result<Vec<(String, String, Vec<u8>)>, GraphyneError> {
        self.server_data
            .aggregator_data
            .wait_all_reports(self.population)
            .await;
        self.server_data.aggregator_data.verify_request_counts();
        Ok(self.server_data.aggregator_data.take_merged())
    }

    /// APPLY_MUTATIONS: drains the mutation buffer through the resolver.
    async fn apply_mutations(&self) -> Result<(), GraphyneError> {
        let server_data = self.server_data.clone();
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || {
            server_data.resolve_mutations(|id| processor.partition_for(id))
        })
        .await?
    }

    /// Writes a checkpoint for the coming superstep. Failures are logged
    /// and the next checkpoint is retried.
    async fn checkpoint(&self, superstep: SuperstepId) {
        let result = self.try_checkpoint(superstep).await;
        match result {
            Ok(()) => self.metrics.add_checkpoints_written(1),
            Err(e) => {
                pf_warn!(
                    self.me;
                    "checkpoint for superstep {} failed: {}",
                    superstep,
                    e
                );
            }
        }
    }

    async fn try_checkpoint(
        &self,
        superstep: SuperstepId,
    ) -> Result<(), GraphyneError> {
        let mut partitions = Vec::new();
        for partition_id in self.server_data.partition_store.partition_ids()
        {
            let handle = self
                .server_data
                .partition_store
                .get(partition_id)?
                .ok_or_else(|| GraphyneError::msg("partition vanished"))?;
            let partition = handle.lock();
            let mut buf = BytesMut::new();
            partition.write(&mut buf)?;
            partitions.push((partition_id, buf.to_vec()));
        }

        let file = CheckpointFile {
            superstep,
            partitions,
            inbox: self.server_data.message_store.export_current(),
            finalized: self.aggregators.finalized_values(),
        };
        write_checkpoint(
            std::path::Path::new(&self.harness.config.checkpoint_directory),
            self.me,
            &file,
        )
        .await
    }

    /// Restart path: re-hydrates partitions, the frozen inbox, and the
    /// aggregator values from a named checkpoint superstep.
    async fn restore_checkpoint(
        &mut self,
        setup: &JobSetupBlob,
        superstep: SuperstepId,
    ) -> Result<(), GraphyneError> {
        let file = read_checkpoint(
            std::path::Path::new(&self.harness.config.checkpoint_directory),
            superstep,
            self.me,
        )
        .await?;

        let layout = self.server_data.layout();
        for (_, bytes) in file.partitions {
            let mut buf = Bytes::from(bytes);
            let partition: Partition<I, V, E> =
                Partition::read_fields(&mut buf, layout)?;
            self.server_data.partition_store.add(partition)?;
        }
        self.server_data.message_store.restore_current(file.inbox)?;
        self.aggregators
            .configure(&setup.registered, file.finalized)?;
        pf_info!(
            self.me;
            "restored checkpoint, resuming at superstep {}",
            superstep
        );
        Ok(())
    }

    /// TERMINATE: streams owned vertices through the output format.
    async fn write_output(&self) -> Result<(), GraphyneError> {
        let output = match &self.harness.output {
            Some(output) => output.clone(),
            None => return Ok(()),
        };
        let me = self.me;
        let server_data = self.server_data.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GraphyneError> {
            let mut writer = output.create_writer(me)?;
            let mut first_error: Option<GraphyneError> = None;
            for partition_id in server_data.partition_store.partition_ids()
            {
                let handle = server_data
                    .partition_store
                    .get(partition_id)?
                    .ok_or_else(|| {
                        GraphyneError::msg("partition vanished")
                    })?;
                let partition = handle.lock();
                partition.for_each_vertex(|vertex| {
                    if first_error.is_none() {
                        if let Err(e) = writer.write_vertex(vertex) {
                            first_error = Some(e);
                        }
                    }
                })?;
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            let bytes = writer.close()?;
            pf_info!(me; "wrote {} output bytes", bytes);
            Ok(())
        })
        .await?
    }
}

/// The worker owning an aggregator name: stable hash modulo population.
pub(crate) fn aggregator_owner(name: &str, population: u32) -> WorkerId {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % u64::from(population.max(1))) as WorkerId
}

/// Reads one vertex split and routes its vertices, bucketed per partition.
fn read_vertex_split<I, V, E, M>(
    input: &dyn VertexInputFormat<I, V, E>,
    processor: &RequestProcessor<I, V, E, M>,
    descriptor: &[u8],
) -> Result<(u64, u64), GraphyneError>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    let mut vertices_read = 0u64;
    let mut edges_read = 0u64;
    let mut buckets: HashMap<PartitionId, Vec<crate::graph::Vertex<I, V, E>>> =
        HashMap::new();

    for vertex in input.open(descriptor)? {
        let vertex = vertex?;
        vertices_read += 1;
        edges_read += vertex.num_edges() as u64;
        let partition = processor.partition_for(vertex.id());
        let bucket = buckets.entry(partition).or_default();
        bucket.push(vertex);
        if bucket.len() >= 1024 {
            let batch = std::mem::take(bucket);
            processor.send_vertices(partition, batch)?;
        }
    }
    for (partition, bucket) in buckets {
        if !bucket.is_empty() {
            processor.send_vertices(partition, bucket)?;
        }
    }
    Ok((vertices_read, edges_read))
}

/// Reads one edge split and routes each edge as a mutation on its source
/// vertex (the resolver materializes absent sources).
fn read_edge_split<I, E, V, M>(
    input: &dyn EdgeInputFormat<I, E>,
    processor: &RequestProcessor<I, V, E, M>,
    descriptor: &[u8],
) -> Result<u64, GraphyneError>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    let mut edges_read = 0u64;
    for entry in input.open(descriptor)? {
        let (source, edge) = entry?;
        edges_read += 1;
        processor.add_edge_request(source, edge)?;
    }
    Ok(edges_read)
}

#[cfg(test)]
mod worker_config_tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::from_config_str(None).unwrap();
        assert!(!config.use_out_of_core_graph);
        assert_eq!(config.max_partitions_in_memory, 16);
    }

    #[test]
    fn config_overlay() {
        let config = WorkerConfig::from_config_str(Some(
            "use_out_of_core_graph = true\nmax_partitions_in_memory = 2",
        ))
        .unwrap();
        assert!(config.use_out_of_core_graph);
        assert_eq!(config.max_partitions_in_memory, 2);
    }

    #[test]
    fn config_rejects_unknown_field() {
        assert!(WorkerConfig::from_config_str(Some("bogus = 1")).is_err());
    }

    #[test]
    fn aggregator_owner_is_stable() {
        let a = aggregator_owner("sum", 4);
        let b = aggregator_owner("sum", 4);
        assert_eq!(a, b);
        assert!(a < 4);
    }
}
