//! Compute pass: dispatches partition work items onto a fixed thread pool.
//! Each thread is pinned to one partition for the duration of its pass; a
//! vertex with pending messages is reactivated even if it voted to halt.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::comm::RequestProcessor;
use crate::graph::{PartitionId, SuperstepId, VertexId, WireData};
use crate::program::{ComputeContext, VertexProgram};
use crate::utils::GraphyneError;
use crate::worker::aggregator::WorkerAggregatorUsage;
use crate::worker::server_data::SharedServerData;

/// Fixed-size pool executing partition compute passes.
pub struct ComputePool {
    pool: rayon::ThreadPool,
}

/// Result of one worker's compute pass over its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputePassStats {
    /// Vertices still active (not halted) after the pass.
    pub active_vertices: u64,

    /// Vertices whose compute function ran.
    pub computed_vertices: u64,

    /// Vertices resident after the pass.
    pub total_vertices: u64,

    /// Edges resident after the pass.
    pub total_edges: u64,
}

impl ComputePool {
    pub fn new(threads: usize) -> Result<Self, GraphyneError> {
        if threads == 0 {
            return Err(GraphyneError::msg("compute_threads must be >= 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("compute-{}", i))
            .build()
            .map_err(|e| GraphyneError::msg(e))?;
        Ok(ComputePool { pool })
    }

    /// Runs the user program over every owned partition. Returns the pass
    /// stats, or the first fatal error (a user compute fault aborts the
    /// whole job with the offending vertex id).
    #[allow(clippy::too_many_arguments)]
    pub fn run_superstep<I, V, E, M>(
        &self,
        superstep: SuperstepId,
        total_vertices: u64,
        total_edges: u64,
        partitions: &[PartitionId],
        server_data: &SharedServerData<I, V, E, M>,
        processor: &Arc<RequestProcessor<I, V, E, M>>,
        aggregators: &Arc<WorkerAggregatorUsage>,
        program: &Arc<dyn VertexProgram<I, V, E, M>>,
    ) -> Result<ComputePassStats, GraphyneError>
    where
        I: VertexId,
        V: WireData,
        E: WireData,
        M: WireData,
    {
        let active = AtomicU64::new(0);
        let computed = AtomicU64::new(0);
        let resident_vertices = AtomicU64::new(0);
        let resident_edges = AtomicU64::new(0);
        let first_error: Mutex<Option<GraphyneError>> = Mutex::new(None);

        self.pool.install(|| {
            partitions.par_iter().for_each(|&partition_id| {
                if first_error.lock().is_some() {
                    return; // abort: no new partitions are dispatched
                }
                match compute_partition(
                    superstep,
                    total_vertices,
                    total_edges,
                    partition_id,
                    server_data,
                    processor,
                    aggregators,
                    program,
                ) {
                    Ok(stats) => {
                        active.fetch_add(
                            stats.active_vertices,
                            Ordering::Relaxed,
                        );
                        computed.fetch_add(
                            stats.computed_vertices,
                            Ordering::Relaxed,
                        );
                        resident_vertices.fetch_add(
                            stats.total_vertices,
                            Ordering::Relaxed,
                        );
                        resident_edges
                            .fetch_add(stats.total_edges, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        });

        if let Some(e) = first_error.lock().take() {
            return Err(e);
        }
        Ok(ComputePassStats {
            active_vertices: active.load(Ordering::Relaxed),
            computed_vertices: computed.load(Ordering::Relaxed),
            total_vertices: resident_vertices.load(Ordering::Relaxed),
            total_edges: resident_edges.load(Ordering::Relaxed),
        })
    }
}

/// Computes one partition: every non-halted vertex runs, and every halted
/// vertex with messages wakes and runs.
#[allow(clippy::too_many_arguments)]
fn compute_partition<I, V, E, M>(
    superstep: SuperstepId,
    total_vertices: u64,
    total_edges: u64,
    partition_id: PartitionId,
    server_data: &SharedServerData<I, V, E, M>,
    processor: &Arc<RequestProcessor<I, V, E, M>>,
    aggregators: &Arc<WorkerAggregatorUsage>,
    program: &Arc<dyn VertexProgram<I, V, E, M>>,
) -> Result<ComputePassStats, GraphyneError>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    let handle = match server_data.partition_store.get(partition_id)? {
        Some(handle) => handle,
        None => {
            // owned but never populated; an empty partition computes as
            // empty
            return Ok(ComputePassStats {
                active_vertices: 0,
                computed_vertices: 0,
                total_vertices: 0,
                total_edges: 0,
            });
        }
    };
    let mut partition = handle.lock();

    let mut scratch: HashMap<String, Vec<u8>> = HashMap::new();
    let mut ctx = ComputeContext::new(
        superstep,
        total_vertices,
        total_edges,
        processor,
        aggregators,
        &mut scratch,
    );

    let mut active = 0u64;
    let mut computed = 0u64;
    let mut first_error: Option<GraphyneError> = None;

    partition.update_vertices(|vertex| {
        if first_error.is_some() {
            return;
        }

        let messages_handle = server_data
            .message_store
            .vertex_messages(partition_id, vertex.id());
        let guard;
        let messages: &[M] = match &messages_handle {
            Some(handle) => {
                guard = handle.lock();
                &guard
            }
            None => &[],
        };

        if !messages.is_empty() {
            vertex.wake();
        }
        if vertex.is_halted() {
            return;
        }

        computed += 1;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            program.compute(&mut ctx, vertex, messages)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error = Some(GraphyneError::UserCompute(format!(
                    "vertex {:?}: {}",
                    vertex.id(),
                    e
                )));
            }
            Err(panic) => {
                let cause = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                first_error = Some(GraphyneError::UserCompute(format!(
                    "vertex {:?}: {}",
                    vertex.id(),
                    cause
                )));
            }
        }
        if !vertex.is_halted() {
            active += 1;
        }
    })?;
    drop(ctx);

    if let Some(e) = first_error {
        return Err(e);
    }
    aggregators.merge_scratch(scratch)?;
    Ok(ComputePassStats {
        active_vertices: active,
        computed_vertices: computed,
        total_vertices: partition.vertex_count(),
        total_edges: partition.edge_count(),
    })
}

#[cfg(test)]
mod compute_tests {
    use super::*;
    use crate::comm::PartitionOwner;
    use crate::graph::{
        AggregatorCatalog, PartitionLayout, TypeSuite, Vertex,
    };
    use crate::program::VertexProgram;
    use crate::worker::server_data::ServerData;
    use tokio::sync::mpsc;

    struct CountDown;

    impl VertexProgram<i32, i32, i32, i32> for CountDown {
        fn compute(
            &self,
            ctx: &mut ComputeContext<'_, i32, i32, i32, i32>,
            vertex: &mut Vertex<i32, i32, i32>,
            _messages: &[i32],
        ) -> Result<(), GraphyneError> {
            ctx.aggregate("sum", i64::from(*vertex.id()))?;
            vertex.value -= 1;
            if vertex.value <= 0 {
                vertex.vote_to_halt();
            }
            Ok(())
        }
    }

    struct Faulty;

    impl VertexProgram<i32, i32, i32, i32> for Faulty {
        fn compute(
            &self,
            _ctx: &mut ComputeContext<'_, i32, i32, i32, i32>,
            vertex: &mut Vertex<i32, i32, i32>,
            _messages: &[i32],
        ) -> Result<(), GraphyneError> {
            if *vertex.id() == 3 {
                panic!("boom");
            }
            Ok(())
        }
    }

    fn harness() -> (
        SharedServerData<i32, i32, i32, i32>,
        Arc<RequestProcessor<i32, i32, i32, i32>>,
        Arc<WorkerAggregatorUsage>,
    ) {
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
        let (tx_out, _rx_out) = mpsc::channel(64);
        let processor = Arc::new(RequestProcessor::new(
            0,
            data.clone(),
            tx_out,
            1 << 20,
        ));
        processor.set_owners(vec![PartitionOwner {
            partition: 0,
            worker: 0,
            addr: "127.0.0.1:0".parse().unwrap(),
        }]);
        let aggregators = Arc::new(WorkerAggregatorUsage::new(
            AggregatorCatalog::with_builtins(),
        ));
        aggregators
            .configure(
                &[crate::graph::RegisteredAggregator {
                    name: "sum".into(),
                    kind: "sum_i64".into(),
                    persistent: false,
                }],
                HashMap::new(),
            )
            .unwrap();
        (data, processor, aggregators)
    }

    #[test]
    fn pass_computes_and_counts_active() -> Result<(), GraphyneError> {
        let (data, processor, aggregators) = harness();
        data.local_vertices(
            0,
            vec![Vertex::new(1, 2), Vertex::new(2, 1), Vertex::new(3, 1)],
        )?;

        let pool = ComputePool::new(2)?;
        let program: Arc<dyn VertexProgram<i32, i32, i32, i32>> =
            Arc::new(CountDown);
        let stats = pool.run_superstep(
            0,
            3,
            0,
            &[0],
            &data,
            &processor,
            &aggregators,
            &program,
        )?;

        // vertices 2 and 3 reach zero and halt; vertex 1 stays active
        assert_eq!(stats.computed_vertices, 3);
        assert_eq!(stats.active_vertices, 1);
        assert_eq!(stats.total_vertices, 3);

        let partials = aggregators.take_partials()?;
        assert_eq!(partials.len(), 1);
        assert_eq!(i64::from_bytes(&partials[0].2)?, 6);
        Ok(())
    }

    #[test]
    fn halted_vertices_skip_until_messaged() -> Result<(), GraphyneError> {
        let (data, processor, aggregators) = harness();
        let mut halted = Vertex::new(7, 5);
        halted.vote_to_halt();
        data.local_vertices(0, vec![halted])?;

        let pool = ComputePool::new(1)?;
        let program: Arc<dyn VertexProgram<i32, i32, i32, i32>> =
            Arc::new(CountDown);

        let stats = pool.run_superstep(
            0,
            1,
            0,
            &[0],
            &data,
            &processor,
            &aggregators,
            &program,
        )?;
        assert_eq!(stats.computed_vertices, 0);
        assert_eq!(stats.active_vertices, 0);

        // a message wakes the vertex for the next pass
        data.message_store.add_message(0, 7, 1);
        data.message_store.swap();
        let stats = pool.run_superstep(
            1,
            1,
            0,
            &[0],
            &data,
            &processor,
            &aggregators,
            &program,
        )?;
        assert_eq!(stats.computed_vertices, 1);
        Ok(())
    }

    #[test]
    fn user_panic_is_fatal_with_vertex_id() -> Result<(), GraphyneError> {
        let (data, processor, aggregators) = harness();
        data.local_vertices(0, vec![Vertex::new(3, 1)])?;

        let pool = ComputePool::new(1)?;
        let program: Arc<dyn VertexProgram<i32, i32, i32, i32>> =
            Arc::new(Faulty);
        let res = pool.run_superstep(
            0,
            1,
            0,
            &[0],
            &data,
            &processor,
            &aggregators,
            &program,
        );
        match res {
            Err(GraphyneError::UserCompute(msg)) => {
                assert!(msg.contains('3'));
                assert!(msg.contains("boom"));
            }
            other => panic!("expected user compute error, got {:?}", other),
        }
        Ok(())
    }
}
