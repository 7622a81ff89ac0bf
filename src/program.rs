//! User program surface: the per-vertex compute function, its context
//! handle, message combiners, and master observer hooks.

use std::collections::HashMap;

use crate::comm::RequestProcessor;
use crate::graph::{
    Edge, SuperstepId, Vertex, VertexId, WireData,
};
use crate::utils::GraphyneError;
use crate::worker::WorkerAggregatorUsage;

/// User code invoked once per vertex per superstep. May read incoming
/// messages, mutate the vertex value, send messages, request graph
/// mutations, contribute aggregator deltas, and vote to halt.
pub trait VertexProgram<I, V, E, M>: Send + Sync + 'static {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, I, V, E, M>,
        vertex: &mut Vertex<I, V, E>,
        messages: &[M],
    ) -> Result<(), GraphyneError>;
}

/// Commutative-associative reduction over messages destined for the same
/// vertex; `initial` must return the reduction identity.
pub trait Combiner<M>: Send + Sync {
    /// Combines `other` into `original`.
    fn combine(&self, original: &mut M, other: M);

    /// The identity message: combined with any message m, yields m.
    fn initial(&self) -> M;
}

/// Hooks invoked on the master around the application and every superstep
/// (including the input superstep).
pub trait MasterObserver: Send + Sync {
    fn pre_application(&self) {}
    fn pre_superstep(&self, _superstep: SuperstepId) {}
    fn post_superstep(&self, _superstep: SuperstepId) {}
    fn post_application(&self) {}
}

/// Per-compute-call context handed to the vertex program. Aggregator deltas
/// fold into a thread-local scratch owned by the partition work item and
/// merge into the worker partials when the partition pass finishes.
pub struct ComputeContext<'a, I, V, E, M> {
    superstep: SuperstepId,
    total_vertices: u64,
    total_edges: u64,
    processor: &'a RequestProcessor<I, V, E, M>,
    aggregators: &'a WorkerAggregatorUsage,
    scratch: &'a mut HashMap<String, Vec<u8>>,
}

impl<'a, I, V, E, M> ComputeContext<'a, I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub(crate) fn new(
        superstep: SuperstepId,
        total_vertices: u64,
        total_edges: u64,
        processor: &'a RequestProcessor<I, V, E, M>,
        aggregators: &'a WorkerAggregatorUsage,
        scratch: &'a mut HashMap<String, Vec<u8>>,
    ) -> Self {
        ComputeContext {
            superstep,
            total_vertices,
            total_edges,
            processor,
            aggregators,
            scratch,
        }
    }

    /// The current superstep number.
    pub fn superstep(&self) -> SuperstepId {
        self.superstep
    }

    /// Total vertices across all workers as of the previous barrier.
    pub fn total_vertices(&self) -> u64 {
        self.total_vertices
    }

    /// Total edges across all workers as of the previous barrier.
    pub fn total_edges(&self) -> u64 {
        self.total_edges
    }

    /// Sends a message to a destination vertex, visible there next
    /// superstep.
    pub fn send_message(
        &mut self,
        target: I,
        message: M,
    ) -> Result<(), GraphyneError> {
        self.processor.send_message(target, message)
    }

    /// Sends a message along every out-edge of the vertex.
    pub fn send_message_to_all_edges(
        &mut self,
        vertex: &Vertex<I, V, E>,
        message: M,
    ) -> Result<(), GraphyneError> {
        for edge in vertex.edges() {
            self.processor
                .send_message(edge.target.clone(), message.clone())?;
        }
        Ok(())
    }

    /// Requests creation of a vertex, resolved between supersteps.
    pub fn add_vertex_request(
        &mut self,
        vertex: Vertex<I, V, E>,
    ) -> Result<(), GraphyneError> {
        self.processor.add_vertex_request(vertex)
    }

    /// Requests removal of a vertex, resolved between supersteps.
    pub fn remove_vertex_request(
        &mut self,
        vertex: I,
    ) -> Result<(), GraphyneError> {
        self.processor.remove_vertex_request(vertex)
    }

    /// Requests addition of an out-edge on the source vertex.
    pub fn add_edge_request(
        &mut self,
        source: I,
        edge: Edge<I, E>,
    ) -> Result<(), GraphyneError> {
        self.processor.add_edge_request(source, edge)
    }

    /// Requests removal of the first matching out-edge on the source
    /// vertex.
    pub fn remove_edge_request(
        &mut self,
        source: I,
        target: I,
    ) -> Result<(), GraphyneError> {
        self.processor.remove_edge_request(source, target)
    }

    /// Contributes a delta to a registered aggregator.
    pub fn aggregate<A: WireData>(
        &mut self,
        name: &str,
        delta: A,
    ) -> Result<(), GraphyneError> {
        self.aggregators
            .fold_into_scratch(self.scratch, name, &delta.to_bytes())
    }

    /// Reads an aggregator's finalized value from the previous superstep.
    pub fn aggregated<A: WireData>(
        &self,
        name: &str,
    ) -> Result<Option<A>, GraphyneError> {
        self.aggregators.aggregated(name)
    }
}
