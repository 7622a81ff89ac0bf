//! Request client: connection-pooled sender of typed requests to peer
//! workers, with a bounded per-destination outstanding window, per-frame
//! acknowledgements, and same-id retransmission with exponential backoff.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration, Instant};

use crate::comm::wire::{Frame, TAG_ACK};
use crate::comm::{RequestId, WorkerRequest};
use crate::graph::{VertexId, WireData, WorkerId};
use crate::utils::{tcp_connect_with_retry, GraphyneError};

/// One request handed to a per-peer messenger task. The window permit is
/// held until the acknowledgement arrives.
struct SendItem {
    request_id: RequestId,
    bytes: Bytes,
    permit: OwnedSemaphorePermit,
}

/// Per-destination send state shared with the messenger task.
struct PeerHandle {
    tx_send: mpsc::UnboundedSender<SendItem>,
    window: Arc<Semaphore>,
    unreachable: Arc<AtomicBool>,
}

/// Worker request client module.
pub struct RequestClient<I, V, E, M> {
    /// My worker ID.
    me: WorkerId,

    /// Map from peer ID -> send state, shared with messenger tasks.
    peers: Mutex<HashMap<WorkerId, PeerHandle>>,

    /// Monotonic request id counter across all destinations.
    next_request_id: AtomicU64,

    /// Requests enqueued but not yet acknowledged, across all peers.
    outstanding: Arc<AtomicU64>,

    /// Signalled whenever the outstanding counter reaches zero.
    zero_notify: Arc<Notify>,

    /// Fatal error sink: a peer marked unreachable surfaces here.
    tx_fatal: mpsc::UnboundedSender<GraphyneError>,

    /// Per-destination tally of flow-control-counted requests, reset each
    /// superstep and announced through the reserved aggregator name.
    sent_counts: Arc<DashMap<WorkerId, u64>>,

    /// Outstanding-window size per destination.
    max_outstanding: usize,

    /// Base acknowledgement timeout before retransmission.
    timeout: Duration,

    /// Bounded attempt count per request before the peer is declared
    /// unreachable.
    max_attempts: u32,

    _marker: PhantomData<fn() -> (I, V, E, M)>,
}

impl<I, V, E, M> RequestClient<I, V, E, M>
where
    I: VertexId,
    V: WireData,
    E: WireData,
    M: WireData,
{
    pub fn new(
        me: WorkerId,
        max_outstanding: usize,
        timeout: Duration,
        max_attempts: u32,
        tx_fatal: mpsc::UnboundedSender<GraphyneError>,
    ) -> Self {
        RequestClient {
            me,
            peers: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            outstanding: Arc::new(AtomicU64::new(0)),
            zero_notify: Arc::new(Notify::new()),
            tx_fatal,
            sent_counts: Arc::new(DashMap::new()),
            max_outstanding,
            timeout,
            max_attempts,
            _marker: PhantomData,
        }
    }

    /// Connects to a peer worker and spawns its messenger task. Idempotent
    /// for already-connected peers.
    pub async fn connect_to_peer(
        &self,
        peer: WorkerId,
        addr: SocketAddr,
    ) -> Result<(), GraphyneError> {
        if self.peers.lock().contains_key(&peer) {
            return Ok(());
        }
        let stream = tcp_connect_with_retry(addr, 10).await?;
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(self.max_outstanding));
        let unreachable = Arc::new(AtomicBool::new(false));

        let mut messenger = MessengerTask {
            me: self.me,
            peer,
            addr,
            rx_send,
            pending: BTreeMap::new(),
            outstanding: self.outstanding.clone(),
            zero_notify: self.zero_notify.clone(),
            unreachable: unreachable.clone(),
            tx_fatal: self.tx_fatal.clone(),
            timeout: self.timeout,
            max_attempts: self.max_attempts,
        };
        tokio::spawn(async move { messenger.run(stream).await });

        self.peers.lock().insert(
            peer,
            PeerHandle {
                tx_send,
                window,
                unreachable,
            },
        );
        pf_debug!(self.me; "connected to peer worker {} '{}'", peer, addr);
        Ok(())
    }

    pub fn has_peer(&self, peer: WorkerId) -> bool {
        self.peers.lock().contains_key(&peer)
    }

    /// Enqueues a request to a destination worker. Blocks while the
    /// per-destination outstanding window is full; returns promptly once a
    /// slot frees up.
    pub async fn send_request(
        &self,
        dest: WorkerId,
        request: WorkerRequest<I, V, E, M>,
    ) -> Result<(), GraphyneError> {
        let (tx_send, window, unreachable) = {
            let peers = self.peers.lock();
            let handle = peers.get(&dest).ok_or_else(|| {
                GraphyneError::msg(format!("peer {} not connected", dest))
            })?;
            (
                handle.tx_send.clone(),
                handle.window.clone(),
                handle.unreachable.clone(),
            )
        };
        if unreachable.load(Ordering::Acquire) {
            return Err(GraphyneError::Io(format!(
                "peer worker {} unreachable",
                dest
            )));
        }

        if request.counts_for_flow_control() {
            *self.sent_counts.entry(dest).or_insert(0) += 1;
        }

        let permit = window.acquire_owned().await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let bytes = request.into_frame(request_id, self.me).encode();
        let sent = tx_send.send(SendItem {
            request_id,
            bytes,
            permit,
        });
        if sent.is_err() {
            // messenger gone; release the slot so waiters can observe it
            if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.zero_notify.notify_waiters();
            }
            return Err(GraphyneError::Io(format!(
                "peer worker {} messenger gone",
                dest
            )));
        }
        Ok(())
    }

    /// Blocks until every enqueued request has been acknowledged.
    pub async fn wait_all_requests(&self) -> Result<(), GraphyneError> {
        loop {
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            let notified = self.zero_notify.notified();
            tokio::pin!(notified);
            // register interest before the re-check so a wakeup between
            // the check and the await cannot be lost
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Drains the per-destination request tallies for this superstep.
    pub fn take_sent_counts(&self) -> HashMap<WorkerId, u64> {
        let mut counts = HashMap::new();
        let dests: Vec<WorkerId> =
            self.sent_counts.iter().map(|e| *e.key()).collect();
        for dest in dests {
            if let Some((dest, count)) = self.sent_counts.remove(&dest) {
                counts.insert(dest, count);
            }
        }
        counts
    }
}

struct Pending {
    bytes: Bytes,
    attempts: u32,
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

/// Per-peer messenger task: writes frames, matches acknowledgements, and
/// retransmits unacknowledged requests with the same id after a timeout
/// with exponential backoff. Exhausting the attempt budget marks the peer
/// unreachable and surfaces a fatal error.
struct MessengerTask {
    me: WorkerId,
    peer: WorkerId,
    addr: SocketAddr,

    rx_send: mpsc::UnboundedReceiver<SendItem>,
    pending: BTreeMap<RequestId, Pending>,

    outstanding: Arc<AtomicU64>,
    zero_notify: Arc<Notify>,
    unreachable: Arc<AtomicBool>,
    tx_fatal: mpsc::UnboundedSender<GraphyneError>,

    timeout: Duration,
    max_attempts: u32,
}

impl MessengerTask {
    async fn run(&mut self, stream: tokio::net::TcpStream) {
        pf_debug!(self.me; "messenger task for peer {} spawned", self.peer);
        let (mut conn_read, mut conn_write) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(4 + 1024);
        let mut check = time::interval(Duration::from_millis(20));

        loop {
            tokio::select! {
                // a request to send out
                item = self.rx_send.recv() => {
                    match item {
                        Some(item) => {
                            let deadline = Instant::now() + self.timeout;
                            let ok = conn_write
                                .write_all(&item.bytes)
                                .await
                                .is_ok();
                            self.pending.insert(item.request_id, Pending {
                                bytes: item.bytes,
                                attempts: 1,
                                deadline,
                                _permit: item.permit,
                            });
                            if !ok && !self.reconnect(
                                &mut conn_read,
                                &mut conn_write,
                                &mut read_buf,
                            ).await {
                                break;
                            }
                        }
                        None => break, // client dropped
                    }
                },

                // an acknowledgement (or stray frame) from the peer
                frame = Frame::read_from(&mut read_buf, &mut conn_read) => {
                    match frame {
                        Ok(frame) if frame.tag == TAG_ACK => {
                            self.complete(frame.request_id);
                        }
                        Ok(frame) => {
                            pf_warn!(
                                self.me;
                                "unexpected frame tag {:#04x} from peer {}",
                                frame.tag,
                                self.peer
                            );
                        }
                        Err(_) => {
                            // connection broke; reconnect and retransmit
                            if !self.reconnect(
                                &mut conn_read,
                                &mut conn_write,
                                &mut read_buf,
                            ).await {
                                break;
                            }
                        }
                    }
                },

                // retransmission deadlines
                _ = check.tick() => {
                    if !self.retransmit_expired(&mut conn_write).await {
                        break;
                    }
                },
            }
        }

        // release anything still pending or queued so waiters can observe
        // the failure
        let mut leftover = self.pending.len() as u64;
        self.pending.clear();
        self.rx_send.close();
        while self.rx_send.try_recv().is_ok() {
            leftover += 1;
        }
        if leftover > 0 {
            self.outstanding.fetch_sub(leftover, Ordering::AcqRel);
        }
        self.zero_notify.notify_waiters();
        pf_debug!(self.me; "messenger task for peer {} exitted", self.peer);
    }

    /// Marks a request acknowledged: frees its window slot and decrements
    /// the outstanding counter.
    fn complete(&mut self, request_id: RequestId) {
        if self.pending.remove(&request_id).is_some() {
            if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.zero_notify.notify_waiters();
            }
        } else {
            pf_debug!(
                self.me;
                "stale ack {} from peer {}",
                request_id,
                self.peer
            );
        }
    }

    /// Retransmits requests whose acknowledgement deadline passed. Returns
    /// false when the attempt budget is exhausted.
    async fn retransmit_expired(
        &mut self,
        conn_write: &mut OwnedWriteHalf,
    ) -> bool {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for request_id in expired {
            let (attempts, bytes, exhausted) = {
                let pending = self.pending.get_mut(&request_id).unwrap();
                pending.attempts += 1;
                // exponential backoff with jitter on the next deadline
                let backoff = self.timeout
                    * 2u32.saturating_pow(pending.attempts - 1);
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..50),
                );
                pending.deadline = now + backoff + jitter;
                (
                    pending.attempts,
                    pending.bytes.clone(),
                    pending.attempts > self.max_attempts,
                )
            };
            if exhausted {
                self.give_up();
                return false;
            }
            pf_debug!(
                self.me;
                "retransmitting request {} to peer {} (attempt {})",
                request_id,
                self.peer,
                attempts
            );
            if conn_write.write_all(&bytes).await.is_err() {
                // leave the entry; the reconnect path resends in order
                return true;
            }
        }
        true
    }

    /// Re-establishes the connection and retransmits everything pending in
    /// request-id order, preserving FIFO application on the peer.
    async fn reconnect(
        &mut self,
        conn_read: &mut OwnedReadHalf,
        conn_write: &mut OwnedWriteHalf,
        read_buf: &mut BytesMut,
    ) -> bool {
        pf_warn!(
            self.me;
            "connection to peer {} lost, reconnecting...",
            self.peer
        );
        match tcp_connect_with_retry(self.addr, 3).await {
            Ok(stream) => {
                let (new_read, new_write) = stream.into_split();
                *conn_read = new_read;
                *conn_write = new_write;
                read_buf.clear();
                let now = Instant::now();
                let ids: Vec<RequestId> =
                    self.pending.keys().copied().collect();
                for id in ids {
                    let (bytes, exhausted) = {
                        let pending = self.pending.get_mut(&id).unwrap();
                        pending.attempts += 1;
                        pending.deadline = now + self.timeout;
                        (
                            pending.bytes.clone(),
                            pending.attempts > self.max_attempts,
                        )
                    };
                    if exhausted {
                        self.give_up();
                        return false;
                    }
                    if conn_write.write_all(&bytes).await.is_err() {
                        pf_warn!(
                            self.me;
                            "resend of request {} to peer {} failed",
                            id,
                            self.peer
                        );
                        break;
                    }
                }
                true
            }
            Err(_) => {
                self.give_up();
                false
            }
        }
    }

    /// Declares the peer unreachable and surfaces the fatal error.
    fn give_up(&self) {
        self.unreachable.store(true, Ordering::Release);
        pf_error!(
            self.me;
            "peer worker {} unreachable after {} attempts",
            self.peer,
            self.max_attempts
        );
        let _ = self.tx_fatal.send(GraphyneError::Io(format!(
            "peer worker {} unreachable",
            self.peer
        )));
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use crate::comm::RequestServer;
    use crate::graph::{
        AggregatorCatalog, PartitionLayout, TypeSuite, Vertex,
    };
    use crate::worker::ServerData;

    type IntRequest = WorkerRequest<i32, i32, i32, i32>;

    async fn setup_pair() -> Result<
        (
            Arc<crate::worker::ServerData<i32, i32, i32, i32>>,
            RequestClient<i32, i32, i32, i32>,
            mpsc::UnboundedReceiver<GraphyneError>,
        ),
        GraphyneError,
    > {
        let types: TypeSuite<i32, i32, i32, i32> =
            TypeSuite::new(Arc::new(|| 0));
        let data = Arc::new(ServerData::new(
            &types,
            PartitionLayout::VertexMap,
            AggregatorCatalog::with_builtins(),
            None,
        )?);
        let (tx_fatal, rx_fatal) = mpsc::unbounded_channel();
        let server = RequestServer::new_and_setup(
            1,
            "127.0.0.1:0".parse()?,
            data.clone(),
            tx_fatal.clone(),
        )
        .await?;

        let client = RequestClient::new(
            0,
            8,
            Duration::from_millis(500),
            3,
            tx_fatal,
        );
        client.connect_to_peer(1, server.local_addr()).await?;
        // keep the server alive for the duration of the test
        std::mem::forget(server);
        Ok((data, client, rx_fatal))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_vertices_applies_on_server() -> Result<(), GraphyneError> {
        let (data, client, _rx) = setup_pair().await?;

        let vertices: Vec<Vertex<i32, i32, i32>> =
            (0..10).map(|i| Vertex::new(i, i)).collect();
        client
            .send_request(
                1,
                IntRequest::SendVertices {
                    partition: 13,
                    vertices,
                },
            )
            .await?;
        client.wait_all_requests().await?;

        assert!(data.partition_store.has(13));
        let handle = data.partition_store.get(13)?.unwrap();
        let mut total = 0;
        handle.lock().for_each_vertex(|v| total += *v.id())?;
        assert_eq!(total, 45);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_messages_sums_check_out() -> Result<(), GraphyneError> {
        let (data, client, _rx) = setup_pair().await?;

        // vertex i receives messages {0, .., i-1}
        let mut vertices = Vec::new();
        for i in 1..7 {
            vertices.push((i, (0..i).collect::<Vec<i32>>()));
        }
        client
            .send_request(
                1,
                IntRequest::SendWorkerMessages {
                    batches: vec![(0, vertices)],
                },
            )
            .await?;
        client.wait_all_requests().await?;

        let destinations = data.message_store.destination_vertices();
        assert_eq!(destinations.iter().sum::<i32>(), 21);

        data.message_store.swap();
        let mut message_sum = 0;
        for vertex in destinations {
            let handle =
                data.message_store.vertex_messages(0, &vertex).unwrap();
            message_sum += handle.lock().iter().sum::<i32>();
        }
        assert_eq!(message_sum, 35);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_requests_fifo_under_window() -> Result<(), GraphyneError> {
        let (data, client, _rx) = setup_pair().await?;

        // far more requests than the window of 8; each appends one vertex
        for i in 0..100 {
            client
                .send_request(
                    1,
                    IntRequest::SendVertices {
                        partition: 0,
                        vertices: vec![Vertex::new(i, i)],
                    },
                )
                .await?;
        }
        client.send_request(1, IntRequest::Flush).await?;
        client.wait_all_requests().await?;

        let handle = data.partition_store.get(0)?.unwrap();
        assert_eq!(handle.lock().vertex_count(), 100);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flow_control_counts_exclude_control() -> Result<(), GraphyneError>
    {
        let (_data, client, _rx) = setup_pair().await?;

        client
            .send_request(
                1,
                IntRequest::SendVertices {
                    partition: 0,
                    vertices: vec![Vertex::new(1, 1)],
                },
            )
            .await?;
        client.send_request(1, IntRequest::Flush).await?;
        client
            .send_request(1, IntRequest::SendAggregators { entries: vec![] })
            .await?;
        client.wait_all_requests().await?;

        let counts = client.take_sent_counts();
        assert_eq!(counts.get(&1).copied(), Some(1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_peer_surfaces_fatal() -> Result<(), GraphyneError> {
        let (tx_fatal, mut rx_fatal) = mpsc::unbounded_channel();
        let client: RequestClient<i32, i32, i32, i32> = RequestClient::new(
            0,
            4,
            Duration::from_millis(50),
            2,
            tx_fatal,
        );

        // bind a listener that never reads nor acks, then drop it after
        // connect so retransmissions hit a dead address
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        client.connect_to_peer(1, addr).await?;
        drop(listener);

        client.send_request(1, IntRequest::Flush).await?;
        let err = rx_fatal.recv().await.expect("fatal error");
        assert!(matches!(err, GraphyneError::Io(_)));
        assert!(client.send_request(1, IntRequest::Flush).await.is_err());
        Ok(())
    }
}
