//! TCP-backed coordination service: a server fronting any backing
//! `CoordService` (typically the in-process one) plus a client stub that
//! implements the same trait over the wire, so workers and master can run
//! in separate processes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::coord::{CoordService, CoordWatch, SessionId};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, GraphyneError,
};

/// Watch subscription id assigned by the server, unique per connection.
type WatchId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CoordRequest {
    NewSession,
    EndSession { session: SessionId },
    CreatePersistent { path: String, data: Vec<u8> },
    CreateEphemeral {
        session: SessionId,
        path: String,
        data: Vec<u8>,
    },
    Read { path: String },
    List { prefix: String },
    Delete { path: String },
    Watch { prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CoordReply {
    Session { session: SessionId },
    Done,
    Claimed { created: bool },
    Data { data: Option<Vec<u8>> },
    Paths { paths: Vec<String> },
    WatchStarted { watch_id: WatchId },
    /// Unsolicited watch event (request id 0).
    Event { watch_id: WatchId, path: String },
    Failed { message: String },
}

type WireMsg = (u64, CoordReply);

/// Coordination server: accepts client connections and serves requests
/// against the backing service, streaming watch events back.
pub struct CoordServer {
    local_addr: SocketAddr,
    _acceptor_handle: JoinHandle<()>,
}

impl CoordServer {
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        backing: Arc<dyn CoordService>,
    ) -> Result<Self, GraphyneError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, backing));
        pf_info!("coord"; "serving coordination on '{}'", local_addr);
        Ok(CoordServer {
            local_addr,
            _acceptor_handle: acceptor_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn acceptor_task(
        listener: TcpListener,
        backing: Arc<dyn CoordService>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!("coord"; "accepted coord client '{}'", addr);
                    let backing = backing.clone();
                    tokio::spawn(async move {
                        Self::controller_task(stream, backing).await;
                    });
                }
                Err(e) => {
                    pf_warn!("coord"; "error accepting coord client: {}", e);
                }
            }
        }
    }

    /// Per-connection controller task: serves requests, forwards watch
    /// events.
    async fn controller_task(
        stream: TcpStream,
        backing: Arc<dyn CoordService>,
    ) {
        let (mut conn_read, conn_write) = stream.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;
        let mut retrying = false;

        let (tx_reply, mut rx_reply) = mpsc::unbounded_channel::<WireMsg>();
        let mut next_watch_id: WatchId = 1;
        let mut watch_forwarders: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                // a reply or watch event to push to the client
                msg = rx_reply.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {}
                                Ok(false) => retrying = true,
                                Err(_) => break,
                            }
                        }
                        None => break,
                    }
                },

                // retrying last unsuccessful write
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None::<&WireMsg>,
                    ) {
                        Ok(true) => retrying = false,
                        Ok(false) => {}
                        Err(_) => break,
                    }
                },

                // next request from the client
                req = safe_tcp_read::<(u64, CoordRequest), _>(
                    &mut read_buf,
                    &mut conn_read,
                ) => {
                    let (req_id, request) = match req {
                        Ok(pair) => pair,
                        Err(_) => break, // client gone
                    };
                    let reply = match request {
                        CoordRequest::Watch { prefix } => {
                            match backing.watch(&prefix).await {
                                Ok(mut watch) => {
                                    let watch_id = next_watch_id;
                                    next_watch_id += 1;
                                    // the started reply must precede any
                                    // event from the forwarder
                                    if tx_reply
                                        .send((
                                            req_id,
                                            CoordReply::WatchStarted {
                                                watch_id,
                                            },
                                        ))
                                        .is_err()
                                    {
                                        break;
                                    }
                                    let tx_events = tx_reply.clone();
                                    watch_forwarders.push(tokio::spawn(
                                        async move {
                                            while let Ok(path) =
                                                watch.changed().await
                                            {
                                                let event =
                                                    CoordReply::Event {
                                                        watch_id,
                                                        path,
                                                    };
                                                if tx_events
                                                    .send((0, event))
                                                    .is_err()
                                                {
                                                    break;
                                                }
                                            }
                                        },
                                    ));
                                    continue;
                                }
                                Err(e) => CoordReply::Failed {
                                    message: e.to_string(),
                                },
                            }
                        }
                        request => Self::serve(&backing, request).await,
                    };
                    if tx_reply.send((req_id, reply)).is_err() {
                        break;
                    }
                },
            }
        }

        for forwarder in watch_forwarders {
            forwarder.abort();
        }
        pf_debug!("coord"; "coord controller task exitted");
    }

    async fn serve(
        backing: &Arc<dyn CoordService>,
        request: CoordRequest,
    ) -> CoordReply {
        let result = match request {
            CoordRequest::NewSession => backing
                .new_session()
                .await
                .map(|session| CoordReply::Session { session }),
            CoordRequest::EndSession { session } => backing
                .end_session(session)
                .await
                .map(|()| CoordReply::Done),
            CoordRequest::CreatePersistent { path, data } => backing
                .create_persistent(&path, data)
                .await
                .map(|()| CoordReply::Done),
            CoordRequest::CreateEphemeral {
                session,
                path,
                data,
            } => backing
                .create_ephemeral(session, &path, data)
                .await
                .map(|created| CoordReply::Claimed { created }),
            CoordRequest::Read { path } => backing
                .read(&path)
                .await
                .map(|data| CoordReply::Data { data }),
            CoordRequest::List { prefix } => backing
                .list(&prefix)
                .await
                .map(|paths| CoordReply::Paths { paths }),
            CoordRequest::Delete { path } => {
                backing.delete(&path).await.map(|()| CoordReply::Done)
            }
            CoordRequest::Watch { .. } => {
                // handled inline by the controller so the started reply
                // precedes any forwarded event
                Err(GraphyneError::CoordinationLost(
                    "watch reached generic serve path".into(),
                ))
            }
        };
        result.unwrap_or_else(|e| CoordReply::Failed {
            message: e.to_string(),
        })
    }
}

enum Completion {
    Plain(oneshot::Sender<CoordReply>),
    Watch(oneshot::Sender<(CoordReply, broadcast::Receiver<String>)>),
}

/// Client stub implementing `CoordService` against a remote `CoordServer`.
pub struct RemoteCoord {
    tx_req: mpsc::UnboundedSender<(u64, CoordRequest, Completion)>,
    next_req_id: AtomicU64,
    _messenger_handle: JoinHandle<()>,
}

impl RemoteCoord {
    pub async fn new_and_connect(
        server_addr: SocketAddr,
    ) -> Result<Self, GraphyneError> {
        let stream = tcp_connect_with_retry(server_addr, 10).await?;
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let messenger_handle =
            tokio::spawn(Self::messenger_task(stream, rx_req));
        Ok(RemoteCoord {
            tx_req,
            next_req_id: AtomicU64::new(1),
            _messenger_handle: messenger_handle,
        })
    }

    async fn do_request(
        &self,
        request: CoordRequest,
    ) -> Result<CoordReply, GraphyneError> {
        let (tx_done, rx_done) = oneshot::channel();
        let req_id = self.next_req_id.fetch_add(1, Ordering::AcqRel);
        self.tx_req
            .send((req_id, request, Completion::Plain(tx_done)))
            .map_err(|_| {
                GraphyneError::CoordinationLost(
                    "coordination messenger gone".into(),
                )
            })?;
        let reply = rx_done.await.map_err(|_| {
            GraphyneError::CoordinationLost(
                "coordination request dropped".into(),
            )
        })?;
        match reply {
            CoordReply::Failed { message } => {
                Err(GraphyneError::CoordinationLost(message))
            }
            reply => Ok(reply),
        }
    }

    /// Messenger task: writes requests, routes replies to completions and
    /// watch events to their subscription channels.
    async fn messenger_task(
        stream: TcpStream,
        mut rx_req: mpsc::UnboundedReceiver<(u64, CoordRequest, Completion)>,
    ) {
        let (mut conn_read, conn_write): (OwnedReadHalf, OwnedWriteHalf) =
            stream.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let pending: Mutex<HashMap<u64, Completion>> =
            Mutex::new(HashMap::new());
        let watches: Mutex<HashMap<WatchId, broadcast::Sender<String>>> =
            Mutex::new(HashMap::new());

        loop {
            tokio::select! {
                // an outgoing request
                req = rx_req.recv() => {
                    match req {
                        Some((req_id, request, completion)) => {
                            pending.lock().insert(req_id, completion);
                            let msg = (req_id, request);
                            let mut sent = safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            );
                            while let Ok(false) = sent {
                                if conn_write.writable().await.is_err() {
                                    return;
                                }
                                sent = safe_tcp_write(
                                    &mut write_buf,
                                    &mut write_buf_cursor,
                                    &conn_write,
                                    None::<&(u64, CoordRequest)>,
                                );
                            }
                            if sent.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                },

                // an incoming reply or event
                msg = safe_tcp_read::<WireMsg, _>(
                    &mut read_buf,
                    &mut conn_read,
                ) => {
                    let (req_id, reply) = match msg {
                        Ok(pair) => pair,
                        Err(_) => return, // server gone
                    };
                    match reply {
                        CoordReply::Event { watch_id, path } => {
                            if let Some(tx) = watches.lock().get(&watch_id) {
                                let _ = tx.send(path);
                            }
                        }
                        CoordReply::WatchStarted { watch_id } => {
                            let (tx_events, rx_events) =
                                broadcast::channel(4096);
                            watches.lock().insert(watch_id, tx_events);
                            if let Some(Completion::Watch(tx_done)) =
                                pending.lock().remove(&req_id)
                            {
                                let _ = tx_done.send((
                                    CoordReply::WatchStarted { watch_id },
                                    rx_events,
                                ));
                            }
                        }
                        reply => {
                            if let Some(completion) =
                                pending.lock().remove(&req_id)
                            {
                                match completion {
                                    Completion::Plain(tx_done) => {
                                        let _ = tx_done.send(reply);
                                    }
                                    Completion::Watch(_) => {
                                        pf_warn!(
                                            "coord";
                                            "watch request got {:?}",
                                            reply
                                        );
                                    }
                                }
                            }
                        }
                    }
                },
            }
        }
    }
}

#[async_trait]
impl CoordService for RemoteCoord {
    async fn new_session(&self) -> Result<SessionId, GraphyneError> {
        match self.do_request(CoordRequest::NewSession).await? {
            CoordReply::Session { session } => Ok(session),
            reply => unexpected(reply),
        }
    }

    async fn end_session(
        &self,
        session: SessionId,
    ) -> Result<(), GraphyneError> {
        match self.do_request(CoordRequest::EndSession { session }).await? {
            CoordReply::Done => Ok(()),
            reply => unexpected(reply),
        }
    }

    async fn create_persistent(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), GraphyneError> {
        let request = CoordRequest::CreatePersistent {
            path: path.to_string(),
            data,
        };
        match self.do_request(request).await? {
            CoordReply::Done => Ok(()),
            reply => unexpected(reply),
        }
    }

    async fn create_ephemeral(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
    ) -> Result<bool, GraphyneError> {
        let request = CoordRequest::CreateEphemeral {
            session,
            path: path.to_string(),
            data,
        };
        match self.do_request(request).await? {
            CoordReply::Claimed { created } => Ok(created),
            reply => unexpected(reply),
        }
    }

    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<Vec<u8>>, GraphyneError> {
        let request = CoordRequest::Read {
            path: path.to_string(),
        };
        match self.do_request(request).await? {
            CoordReply::Data { data } => Ok(data),
            reply => unexpected(reply),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GraphyneError> {
        let request = CoordRequest::List {
            prefix: prefix.to_string(),
        };
        match self.do_request(request).await? {
            CoordReply::Paths { paths } => Ok(paths),
            reply => unexpected(reply),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), GraphyneError> {
        let request = CoordRequest::Delete {
            path: path.to_string(),
        };
        match self.do_request(request).await? {
            CoordReply::Done => Ok(()),
            reply => unexpected(reply),
        }
    }

    async fn watch(&self, prefix: &str) -> Result<CoordWatch, GraphyneError> {
        let (tx_done, rx_done) = oneshot::channel();
        let req_id = self.next_req_id.fetch_add(1, Ordering::AcqRel);
        self.tx_req
            .send((
                req_id,
                CoordRequest::Watch {
                    prefix: prefix.to_string(),
                },
                Completion::Watch(tx_done),
            ))
            .map_err(|_| {
                GraphyneError::CoordinationLost(
                    "coordination messenger gone".into(),
                )
            })?;
        let (_, rx_events) = rx_done.await.map_err(|_| {
            GraphyneError::CoordinationLost(
                "coordination watch request dropped".into(),
            )
        })?;
        Ok(CoordWatch::new(rx_events, prefix.to_string()))
    }
}

fn unexpected<T>(reply: CoordReply) -> Result<T, GraphyneError> {
    Err(GraphyneError::CoordinationLost(format!(
        "unexpected coordination reply {:?}",
        reply
    )))
}

#[cfg(test)]
mod remote_tests {
    use super::*;
    use crate::coord::MemCoord;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_round_trip() -> Result<(), GraphyneError> {
        let backing = Arc::new(MemCoord::new());
        let server = CoordServer::new_and_setup(
            "127.0.0.1:0".parse()?,
            backing,
        )
        .await?;

        let client = RemoteCoord::new_and_connect(server.local_addr()).await?;
        let session = client.new_session().await?;

        client.create_persistent("/job/setup", vec![7]).await?;
        assert_eq!(client.read("/job/setup").await?, Some(vec![7]));

        assert!(client.create_ephemeral(session, "/claim", vec![]).await?);
        assert!(!client.create_ephemeral(session, "/claim", vec![]).await?);

        assert_eq!(
            client.list("/job/").await?,
            vec!["/job/setup".to_string()]
        );

        client.delete("/job/setup").await?;
        assert_eq!(client.read("/job/setup").await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_watch_streams_events() -> Result<(), GraphyneError> {
        let backing = Arc::new(MemCoord::new());
        let server = CoordServer::new_and_setup(
            "127.0.0.1:0".parse()?,
            backing.clone(),
        )
        .await?;

        let client = RemoteCoord::new_and_connect(server.local_addr()).await?;
        let mut watch = client.watch("/superstep/").await?;

        // another client's write is observed through the watch
        let writer = RemoteCoord::new_and_connect(server.local_addr()).await?;
        writer
            .create_persistent("/superstep/0/decision", vec![1])
            .await?;

        assert_eq!(watch.changed().await?, "/superstep/0/decision");
        Ok(())
    }
}
