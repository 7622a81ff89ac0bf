//! Superstep state machine vocabulary and the blobs exchanged with the
//! master through the coordination service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::comm::PartitionOwner;
use crate::graph::{RegisteredAggregator, WorkerId};

/// Worker-side superstep states. `ApplyMutations`, `RollMessages`, and
/// `FinalizeAggregators` together form the post-barrier phase group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperstepState {
    Setup,
    InputSplits,
    VertexExchange,
    Compute,
    FlushRequests,
    Barrier,
    ApplyMutations,
    RollMessages,
    FinalizeAggregators,
    NextSuperstep,
    Terminate,
}

/// Job-wide setup blob published by the master once all workers have
/// registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSetupBlob {
    pub population: u32,
    pub owners: Vec<PartitionOwner>,
    pub registered: Vec<RegisteredAggregator>,
    pub num_vertex_splits: u32,
    pub num_edge_splits: u32,
    /// When set, workers skip the input superstep and re-hydrate from the
    /// named checkpoint superstep.
    pub restart_superstep: Option<i64>,
}

/// Per-worker stats blob carried into the barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: WorkerId,
    pub active_vertices: u64,
    pub total_vertices: u64,
    pub total_edges: u64,
    pub messages_sent: u64,
    /// Owner-merged aggregator values this worker is responsible for.
    pub merged_aggregators: Vec<(String, String, Vec<u8>)>,
}

/// Master decision blob published after each barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SuperstepDecision {
    /// Advance to the next superstep.
    Continue {
        owners: Vec<PartitionOwner>,
        registered: Vec<RegisteredAggregator>,
        finalized: HashMap<String, Vec<u8>>,
        total_vertices: u64,
        total_edges: u64,
        /// Write a checkpoint for the next superstep before computing it.
        checkpoint: bool,
    },

    /// All vertices halted with no messages in flight; the job is done.
    Terminate {
        finalized: HashMap<String, Vec<u8>>,
    },
}

#[cfg(test)]
mod superstep_tests {
    use super::*;

    #[test]
    fn decision_blob_round_trip() {
        let decision = SuperstepDecision::Continue {
            owners: vec![PartitionOwner {
                partition: 0,
                worker: 1,
                addr: "127.0.0.1:7000".parse().unwrap(),
            }],
            registered: vec![],
            finalized: HashMap::from([("sum".to_string(), vec![1, 2])]),
            total_vertices: 10,
            total_edges: 20,
            checkpoint: true,
        };
        let bytes = rmp_serde::encode::to_vec(&decision).unwrap();
        let back: SuperstepDecision =
            rmp_serde::decode::from_slice(&bytes).unwrap();
        match back {
            SuperstepDecision::Continue {
                owners,
                total_vertices,
                checkpoint,
                ..
            } => {
                assert_eq!(owners.len(), 1);
                assert_eq!(total_vertices, 10);
                assert!(checkpoint);
            }
            SuperstepDecision::Terminate { .. } => {
                panic!("wrong decision variant")
            }
        }
    }
}
