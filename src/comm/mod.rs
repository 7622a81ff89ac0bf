//! Worker-to-worker communication: framed request protocol, connection
//! pooled client with bounded outstanding windows, dispatching server, and
//! the owner-routing request processor.

mod client;
mod processor;
mod request;
mod server;
mod wire;

pub use client::RequestClient;
pub use processor::{OutboundItem, RequestProcessor};
pub use request::WorkerRequest;
pub use server::RequestServer;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::graph::{PartitionId, WorkerId};

/// Request ID type, monotonic per client.
pub type RequestId = u64;

/// A (partition-id, worker) binding published by the master at the start of
/// each superstep; immutable within a superstep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwner {
    pub partition: PartitionId,
    pub worker: WorkerId,
    pub addr: SocketAddr,
}
