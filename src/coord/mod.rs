//! Coordination service interface and implementations: an opaque key-value
//! store with ephemeral nodes and watches, carrying input-split claims, the
//! superstep barrier, and partition-ownership blobs.

mod barrier;
mod memory;
mod remote;

pub use barrier::BarrierHandle;
pub use memory::MemCoord;
pub use remote::{CoordServer, RemoteCoord};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::utils::GraphyneError;

/// Coordination session id; ephemeral nodes die with their session.
pub type SessionId = u64;

/// The coordination service contract. Node paths are `/`-separated strings;
/// watches fire on any create/change/delete under a prefix.
#[async_trait]
pub trait CoordService: Send + Sync {
    /// Opens a session scoping ephemeral nodes.
    async fn new_session(&self) -> Result<SessionId, GraphyneError>;

    /// Ends a session, deleting its ephemeral nodes.
    async fn end_session(
        &self,
        session: SessionId,
    ) -> Result<(), GraphyneError>;

    /// Creates or overwrites a persistent node.
    async fn create_persistent(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), GraphyneError>;

    /// Creates an ephemeral node owned by the session. Returns false if the
    /// node already exists (claim lost).
    async fn create_ephemeral(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
    ) -> Result<bool, GraphyneError>;

    /// Reads a node's data.
    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<Vec<u8>>, GraphyneError>;

    /// Lists node paths under a prefix, ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GraphyneError>;

    /// Deletes a node.
    async fn delete(&self, path: &str) -> Result<(), GraphyneError>;

    /// Subscribes to changes under a prefix. Create the watch before
    /// reading to avoid missing events.
    async fn watch(&self, prefix: &str) -> Result<CoordWatch, GraphyneError>;
}

/// A subscription to node changes under a path prefix.
pub struct CoordWatch {
    rx: broadcast::Receiver<String>,
    prefix: String,
}

impl CoordWatch {
    pub(crate) fn new(rx: broadcast::Receiver<String>, prefix: String) -> Self {
        CoordWatch { rx, prefix }
    }

    /// Waits for the next change under the watched prefix, returning the
    /// changed path. A lagged receiver reports `CoordinationLost`.
    pub async fn changed(&mut self) -> Result<String, GraphyneError> {
        loop {
            match self.rx.recv().await {
                Ok(path) => {
                    if path.starts_with(&self.prefix) {
                        return Ok(path);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // missed events only mean we should re-scan
                    return Ok(self.prefix.clone());
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(GraphyneError::CoordinationLost(
                        "coordination event stream closed".into(),
                    ));
                }
            }
        }
    }
}
