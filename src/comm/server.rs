//! Request server: accepts peer connections and dispatches decoded requests
//! to handlers executing against the worker's server data. Applies each
//! (source, request id) at most once and acknowledges every frame.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::comm::wire::Frame;
use crate::comm::{RequestId, WorkerRequest};
use crate::graph::{VertexId, WireData, WorkerId};
use crate::utils::{tcp_bind_with_retry, GraphyneError};
use crate::worker::SharedServerData;

/// Worker-facing request server module.
pub struct RequestServer<I, V, E, M> {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the peer acceptor task.
    _acceptor_handle: JoinHandle<()>,

    _marker: PhantomData<fn() -> (I, V, E, M)>,
}

impl<I, V, E, M> RequestServer<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    /// Creates a new request server. Spawns the acceptor task; per-peer
    /// servant tasks are spawned as connections arrive. Fatal server-side
    /// errors (protocol violations, handler failures) go to `tx_fatal`.
    pub async fn new_and_setup(
        me: WorkerId,
        bind_addr: SocketAddr,
        server_data: SharedServerData<I, V, E, M>,
        tx_fatal: mpsc::UnboundedSender<GraphyneError>,
    ) -> Result<Self, GraphyneError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;

        let applied: Arc<DashMap<WorkerId, RequestId>> =
            Arc::new(DashMap::new());

        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            listener,
            server_data,
            applied,
            tx_fatal,
        ));

        pf_info!(me; "accepting peer requests on '{}'", local_addr);
        Ok(RequestServer {
            local_addr,
            _acceptor_handle: acceptor_handle,
            _marker: PhantomData,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer acceptor task loop.
    async fn acceptor_task(
        me: WorkerId,
        listener: TcpListener,
        server_data: SharedServerData<I, V, E, M>,
        applied: Arc<DashMap<WorkerId, RequestId>>,
        tx_fatal: mpsc::UnboundedSender<GraphyneError>,
    ) {
        pf_debug!(me; "request acceptor task spawned");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(me; "accepted peer connection from '{}'", addr);
                    let mut servant = ServantTask {
                        me,
                        server_data: server_data.clone(),
                        applied: applied.clone(),
                        tx_fatal: tx_fatal.clone(),
                    };
                    tokio::spawn(async move { servant.run(stream).await });
                }
                Err(e) => {
                    pf_warn!(me; "error accepting peer connection: {}", e);
                }
            }
        }
    }
}

/// Per-connection servant task: reads frames, deduplicates, applies, acks.
struct ServantTask<I, V, E, M> {
    me: WorkerId,
    server_data: SharedServerData<I, V, E, M>,
    applied: Arc<DashMap<WorkerId, RequestId>>,
    tx_fatal: mpsc::UnboundedSender<GraphyneError>,
}

impl<I, V, E, M> ServantTask<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    async fn run(&mut self, stream: TcpStream) {
        let (mut conn_read, mut conn_write) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(4 + 1024);

        loop {
            match Frame::read_from(&mut read_buf, &mut conn_read).await {
                Ok(frame) => {
                    if let Err(e) = self
                        .handle_frame(frame, &mut conn_write)
                        .await
                    {
                        if e.is_retriable() {
                            // connection-level trouble; drop the connection
                            // and let the peer retransmit
                            pf_warn!(self.me; "servant io error: {}", e);
                        } else {
                            pf_error!(self.me; "fatal request error: {}", e);
                            let _ = self.tx_fatal.send(e);
                        }
                        break;
                    }
                }
                Err(GraphyneError::Io(_)) => {
                    // peer closed or reconnecting; retransmissions will
                    // arrive on a fresh connection
                    break;
                }
                Err(e) => {
                    pf_error!(self.me; "fatal frame error: {}", e);
                    let _ = self.tx_fatal.send(e);
                    break;
                }
            }
        }
        pf_debug!(self.me; "servant task exitted");
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), GraphyneError> {
        let source = frame.source;
        let request_id = frame.request_id;

        let duplicate = self
            .applied
            .get(&source)
            .map(|last| request_id <= *last)
            .unwrap_or(false);
        if duplicate {
            // retry of an already-applied request; discard, ack again
            pf_debug!(
                self.me;
                "duplicate request {} from worker {}",
                request_id,
                source
            );
            return Self::write_ack(self.me, request_id, conn_write).await;
        }

        let request = WorkerRequest::from_frame(&frame)?;
        self.server_data.handle(source, request)?;
        self.applied.insert(source, request_id);
        Self::write_ack(self.me, request_id, conn_write).await
    }

    async fn write_ack(
        me: WorkerId,
        request_id: RequestId,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), GraphyneError> {
        let ack = Frame::ack(request_id, me).encode();
        conn_write.write_all(&ack).await?;
        Ok(())
    }
}
