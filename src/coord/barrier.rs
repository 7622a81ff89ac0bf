//! Superstep barrier over the coordination service: workers publish
//! per-superstep entry nodes carrying their stats blob; the master collects
//! all entries, decides, and publishes the decision blob workers wait on.

use std::sync::Arc;

use crate::coord::{CoordService, SessionId};
use crate::graph::{SuperstepId, WorkerId};
use crate::utils::GraphyneError;

/// Handle to the barrier namespace for one job.
pub struct BarrierHandle {
    coord: Arc<dyn CoordService>,
    session: SessionId,
}

impl BarrierHandle {
    pub fn new(coord: Arc<dyn CoordService>, session: SessionId) -> Self {
        BarrierHandle { coord, session }
    }

    fn entry_path(superstep: SuperstepId, worker: WorkerId) -> String {
        format!("/barrier/{}/worker-{}", superstep, worker)
    }

    fn entry_prefix(superstep: SuperstepId) -> String {
        format!("/barrier/{}/worker-", superstep)
    }

    fn decision_path(superstep: SuperstepId) -> String {
        format!("/superstep/{}/decision", superstep)
    }

    /// Worker side: enters the barrier for a superstep, publishing a stats
    /// blob.
    pub async fn enter(
        &self,
        superstep: SuperstepId,
        worker: WorkerId,
        blob: Vec<u8>,
    ) -> Result<(), GraphyneError> {
        let created = self
            .coord
            .create_ephemeral(
                self.session,
                &Self::entry_path(superstep, worker),
                blob,
            )
            .await?;
        if !created {
            return Err(GraphyneError::CoordinationLost(format!(
                "barrier entry for superstep {} worker {} already exists",
                superstep, worker
            )));
        }
        Ok(())
    }

    /// Master side: waits until every worker entered the barrier, returning
    /// each worker's blob.
    pub async fn collect(
        &self,
        superstep: SuperstepId,
        population: u32,
    ) -> Result<Vec<(WorkerId, Vec<u8>)>, GraphyneError> {
        let prefix = Self::entry_prefix(superstep);
        let mut watch = self.coord.watch(&prefix).await?;
        loop {
            let paths = self.coord.list(&prefix).await?;
            if paths.len() as u32 >= population {
                let mut entries = Vec::with_capacity(paths.len());
                for path in paths {
                    let worker: WorkerId = path
                        .rsplit('-')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            GraphyneError::CoordinationLost(format!(
                                "malformed barrier entry '{}'",
                                path
                            ))
                        })?;
                    let blob =
                        self.coord.read(&path).await?.ok_or_else(|| {
                            GraphyneError::CoordinationLost(format!(
                                "barrier entry '{}' vanished",
                                path
                            ))
                        })?;
                    entries.push((worker, blob));
                }
                entries.sort_by_key(|(worker, _)| *worker);
                return Ok(entries);
            }
            watch.changed().await?;
        }
    }

    /// Master side: publishes the superstep decision blob.
    pub async fn publish_decision(
        &self,
        superstep: SuperstepId,
        blob: Vec<u8>,
    ) -> Result<(), GraphyneError> {
        self.coord
            .create_persistent(&Self::decision_path(superstep), blob)
            .await
    }

    /// Worker side: waits for the master's decision for a superstep.
    pub async fn await_decision(
        &self,
        superstep: SuperstepId,
    ) -> Result<Vec<u8>, GraphyneError> {
        let path = Self::decision_path(superstep);
        let mut watch = self.coord.watch(&path).await?;
        loop {
            if let Some(blob) = self.coord.read(&path).await? {
                return Ok(blob);
            }
            watch.changed().await?;
        }
    }

    /// Signals a fatal job abort to all participants.
    pub async fn signal_abort(
        &self,
        cause: &str,
    ) -> Result<(), GraphyneError> {
        self.coord
            .create_persistent("/job/abort", cause.as_bytes().to_vec())
            .await
    }

    /// Checks whether a job abort has been signalled.
    pub async fn aborted(&self) -> Result<Option<String>, GraphyneError> {
        Ok(self
            .coord
            .read("/job/abort")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }
}
