//! Graph data model: wire codec capability, vertices, edges, partition
//! layouts, mutation changesets, the vertex resolver, and the configuration-
//! time capability suites.

mod aggregator;
mod mutation;
mod partition;
mod resolver;
mod types;
mod value;
mod vertex;

pub use aggregator::{
    AggregatorCatalog, AnyAggregator, RegisteredAggregator, TypedAggregator,
    COUNT_AGGREGATOR_NAME,
};
pub use mutation::VertexChanges;
pub use partition::{Partition, PartitionLayout};
pub use resolver::VertexResolver;
pub use types::TypeSuite;
pub use value::{get_blob, get_data, get_utf, put_blob, put_data, put_utf};
pub use value::{VertexId, WireData};
pub use vertex::{Edge, Vertex};

/// Worker ID type (dense, assigned by the master).
pub type WorkerId = u32;

/// Partition ID type (dense non-negative integer).
pub type PartitionId = u32;

/// Superstep counter type. The input superstep is `-1`.
pub type SuperstepId = i64;

/// The superstep during which input splits are read and vertices exchanged.
pub const INPUT_SUPERSTEP: SuperstepId = -1;
