//! Public interface to the Graphyne core library: a bulk-synchronous-parallel
//! vertex-centric graph processing worker runtime, linked by embedding
//! applications and by the in-process job runner.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod comm;
mod coord;
mod graph;
mod io;
mod master;
mod metrics;
mod program;
mod runner;
mod worker;

pub use crate::comm::{
    PartitionOwner, RequestClient, RequestProcessor, RequestServer,
    WorkerRequest,
};
pub use crate::coord::{
    BarrierHandle, CoordServer, CoordService, CoordWatch, MemCoord,
    RemoteCoord, SessionId,
};
pub use crate::graph::{
    AggregatorCatalog, AnyAggregator, Edge, Partition, PartitionId,
    PartitionLayout, RegisteredAggregator, SuperstepId, TypeSuite,
    TypedAggregator, Vertex, VertexChanges, VertexId, WireData, WorkerId,
    INPUT_SUPERSTEP,
};
pub use crate::io::{
    EdgeInputFormat, EdgeReader, InMemoryEdgeInput, InMemoryVertexInput,
    TextVertexInput, TextVertexOutput, VertexInputFormat, VertexOutputFormat,
    VertexReader, VertexWriter,
};
pub use crate::master::{GraphMaster, JobConfig, JobOutcome};
pub use crate::metrics::{MetricsSnapshot, WorkerMetrics};
pub use crate::program::{
    Combiner, ComputeContext, MasterObserver, VertexProgram,
};
pub use crate::runner::{JobSetup, LocalJobRunner};
pub use crate::utils::GraphyneError;
pub use crate::worker::{
    ComputePassStats, ComputePool, GraphWorker, MessageHandle, MessageStore,
    PartitionHandle, PartitionStore, ServerData, SharedServerData,
    SuperstepState, WorkerAggregatorUsage, WorkerConfig, WorkerHarness,
};
