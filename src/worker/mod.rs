//! Worker-side functionality modules: graph stores, aggregator machinery,
//! the compute pool, checkpointing, and the worker runtime driving the
//! superstep state machine.

mod aggregator;
mod checkpoint;
mod compute;
mod message_store;
mod partition_store;
mod server_data;
mod superstep;
#[allow(clippy::module_inception)]
mod worker;

pub use aggregator::{AggregatorServerData, WorkerAggregatorUsage};
pub use compute::{ComputePassStats, ComputePool};
pub use message_store::{MessageHandle, MessageStore};
pub use partition_store::{
    DiskBackedPartitionStore, MemoryPartitionStore, PartitionHandle,
    PartitionStore,
};
pub use server_data::{ServerData, SharedServerData};
pub use superstep::{
    JobSetupBlob, SuperstepDecision, SuperstepState, WorkerStats,
};
pub use worker::{GraphWorker, WorkerConfig, WorkerHarness};

pub(crate) use checkpoint::{
    cleanup_checkpoints, read_checkpoint, write_checkpoint, CheckpointFile,
};
