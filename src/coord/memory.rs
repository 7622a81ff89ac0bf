//! In-process coordination service: a shared node map with broadcast
//! watches and session-scoped ephemeral nodes. Used by the local job runner
//! and as the backing store of the remote coordination server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::coord::{CoordService, CoordWatch, SessionId};
use crate::utils::GraphyneError;

struct Node {
    data: Vec<u8>,
    session: Option<SessionId>,
}

/// In-memory coordination service.
pub struct MemCoord {
    nodes: Mutex<HashMap<String, Node>>,
    events: broadcast::Sender<String>,
    next_session: AtomicU64,
}

impl MemCoord {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(4096);
        MemCoord {
            nodes: Mutex::new(HashMap::new()),
            events,
            next_session: AtomicU64::new(1),
        }
    }

    fn notify(&self, path: &str) {
        // no subscribers is fine
        let _ = self.events.send(path.to_string());
    }
}

impl Default for MemCoord {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordService for MemCoord {
    async fn new_session(&self) -> Result<SessionId, GraphyneError> {
        Ok(self.next_session.fetch_add(1, Ordering::AcqRel))
    }

    async fn end_session(
        &self,
        session: SessionId,
    ) -> Result<(), GraphyneError> {
        let removed: Vec<String> = {
            let mut nodes = self.nodes.lock();
            let paths: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.session == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                nodes.remove(path);
            }
            paths
        };
        for path in removed {
            self.notify(&path);
        }
        Ok(())
    }

    async fn create_persistent(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), GraphyneError> {
        self.nodes.lock().insert(
            path.to_string(),
            Node {
                data,
                session: None,
            },
        );
        self.notify(path);
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
    ) -> Result<bool, GraphyneError> {
        {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(path) {
                return Ok(false);
            }
            nodes.insert(
                path.to_string(),
                Node {
                    data,
                    session: Some(session),
                },
            );
        }
        self.notify(path);
        Ok(true)
    }

    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<Vec<u8>>, GraphyneError> {
        Ok(self.nodes.lock().get(path).map(|node| node.data.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GraphyneError> {
        let mut paths: Vec<String> = self
            .nodes
            .lock()
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<(), GraphyneError> {
        self.nodes.lock().remove(path);
        self.notify(path);
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<CoordWatch, GraphyneError> {
        Ok(CoordWatch::new(self.events.subscribe(), prefix.to_string()))
    }
}
