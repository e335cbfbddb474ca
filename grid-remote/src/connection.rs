use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use grid_core::address::Address;
use grid_core::error::ClientError;
use grid_core::message::auth::AuthResponse;
use grid_core::message::ClientMessage;

use crate::codec::MessageCodec;
use crate::tls::MaybeTlsStream;

pub type ResponseResult = Result<ClientMessage, ClientError>;
pub type ResponseRx = oneshot::Receiver<ResponseResult>;

const SEND_QUEUE_CAPACITY: usize = 10000;

#[derive(Debug)]
pub enum ConnectionEvent {
    /// A member pushed message not bound to any invocation.
    Event {
        connection: Connection,
        message: ClientMessage,
    },
    Closed {
        connection: Connection,
        reason: String,
    },
}

/// A live session with one member. Cloning is cheap and every clone refers to
/// the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    address: Address,
    auth: OnceLock<AuthResponse>,
    tx: mpsc::Sender<ClientMessage>,
    in_flight: DashMap<u64, oneshot::Sender<ResponseResult>>,
    alive: AtomicBool,
    closed: CancellationToken,
    created: Instant,
    last_read_millis: AtomicU64,
    last_write_millis: AtomicU64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    pub fn spawn(
        id: u64,
        address: Address,
        stream: MaybeTlsStream,
        codec: MessageCodec,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (connection, rx) = Self::new(id, address, events, SEND_QUEUE_CAPACITY);
        tokio::spawn(connection.clone().receive_loop(FramedRead::new(read_half, codec)));
        tokio::spawn(connection.clone().send_loop(FramedWrite::new(write_half, codec), rx));
        connection
    }

    fn new(
        id: u64,
        address: Address,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                address,
                auth: OnceLock::new(),
                tx,
                in_flight: DashMap::new(),
                alive: AtomicBool::new(true),
                closed: CancellationToken::new(),
                created: Instant::now(),
                last_read_millis: AtomicU64::new(0),
                last_write_millis: AtomicU64::new(0),
                events,
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Member that authenticated this connection.
    pub fn member(&self) -> Option<Uuid> {
        self.inner.auth.get().map(|auth| Uuid::from_u128(auth.member_uuid))
    }

    pub fn cluster_id(&self) -> Option<Uuid> {
        self.inner.auth.get().map(|auth| Uuid::from_u128(auth.cluster_id))
    }

    pub fn auth(&self) -> Option<&AuthResponse> {
        self.inner.auth.get()
    }

    pub(crate) fn bind(&self, auth: AuthResponse) {
        if self.inner.auth.set(auth).is_err() {
            warn!("{} is already authenticated, ignore new authentication", self);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn since_last_read(&self) -> Duration {
        self.elapsed_since(&self.inner.last_read_millis)
    }

    pub fn since_last_write(&self) -> Duration {
        self.elapsed_since(&self.inner.last_write_millis)
    }

    fn elapsed_since(&self, mark: &AtomicU64) -> Duration {
        let now = self.inner.created.elapsed();
        now.saturating_sub(Duration::from_millis(mark.load(Ordering::Relaxed)))
    }

    fn touch(&self, mark: &AtomicU64) {
        mark.store(self.inner.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Registers the request in the in-flight table and queues it for writing.
    /// `ConnectionUnavailable` means nothing was queued; once `Ok` is returned
    /// the receiver is always completed, with `TargetDisconnected` if the
    /// connection dies first.
    pub async fn send(&self, message: ClientMessage) -> Result<ResponseRx, ClientError> {
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        let correlation_id = message.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.inner.in_flight.insert(correlation_id, tx);
        // removes the entry again if this future is dropped while the queue is full
        let mut registration = Registration {
            connection: self,
            correlation_id,
            armed: true,
        };
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        match self.inner.tx.send(message).await {
            Ok(_) => {
                registration.armed = false;
                Ok(rx)
            }
            // close() may have completed the receiver already
            Err(_) if registration.release() => Err(self.unavailable()),
            Err(_) => Ok(rx),
        }
    }

    /// Drops a pending invocation whose caller stopped waiting.
    pub fn deregister(&self, correlation_id: u64) -> bool {
        self.inner.in_flight.remove(&correlation_id).is_some()
    }

    fn unavailable(&self) -> ClientError {
        ClientError::ConnectionUnavailable(format!("{} is closed", self))
    }

    /// Marks the connection dead, fails every in-flight invocation and reports
    /// the closure once.
    pub fn close(&self, reason: impl Into<String>) {
        if !self.inner.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        self.inner.closed.cancel();
        let pending: Vec<u64> = self.inner.in_flight.iter().map(|e| *e.key()).collect();
        for correlation_id in pending {
            if let Some((_, tx)) = self.inner.in_flight.remove(&correlation_id) {
                let _ = tx.send(Err(ClientError::TargetDisconnected(format!("{} closed: {}", self, reason))));
            }
        }
        info!("{} closed: {}", self, reason);
        let _ = self.inner.events.send(ConnectionEvent::Closed {
            connection: self.clone(),
            reason,
        });
    }

    async fn receive_loop(self, mut framed: FramedRead<ReadHalf<MaybeTlsStream>, MessageCodec>) {
        let reason = loop {
            tokio::select! {
                _ = self.inner.closed.cancelled() => {
                    return;
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            self.touch(&self.inner.last_read_millis);
                            self.dispatch(message);
                        }
                        Some(Err(error)) => {
                            warn!("decode {} frame error {:?}, drop current connection", self, error);
                            break format!("read error {}", error);
                        }
                        None => {
                            break "closed by peer".to_string();
                        }
                    }
                }
            }
        };
        self.close(reason);
    }

    fn dispatch(&self, message: ClientMessage) {
        if message.is_event() {
            let _ = self.inner.events.send(ConnectionEvent::Event {
                connection: self.clone(),
                message,
            });
            return;
        }
        match self.inner.in_flight.remove(&message.correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(message));
            }
            None => {
                debug!("{} drop response {}, nobody is waiting for it", self, message);
            }
        }
    }

    async fn send_loop(
        self,
        mut framed: FramedWrite<WriteHalf<MaybeTlsStream>, MessageCodec>,
        mut rx: mpsc::Receiver<ClientMessage>,
    ) {
        loop {
            let message = tokio::select! {
                _ = self.inner.closed.cancelled() => {
                    break;
                }
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            let correlation_id = message.correlation_id;
            match framed.send(message).await {
                Ok(_) => {
                    self.touch(&self.inner.last_write_millis);
                }
                Err(error) if error.downcast_ref::<std::io::Error>().is_some() => {
                    warn!("send message to {} error {:?}, drop current connection", self, error);
                    self.close(format!("write error {}", error));
                    break;
                }
                Err(error) => {
                    warn!("encode message {} for {} error {:?}", correlation_id, self, error);
                    if let Some((_, tx)) = self.inner.in_flight.remove(&correlation_id) {
                        let _ = tx.send(Err(ClientError::serialization(error)));
                    }
                }
            }
        }
        let _ = framed.close().await;
    }
}

/// In-flight entry owned by a `send` that has not queued its request yet.
struct Registration<'a> {
    connection: &'a Connection,
    correlation_id: u64,
    armed: bool,
}

impl Registration<'_> {
    /// Removes the entry now, `false` if someone else completed it first.
    fn release(&mut self) -> bool {
        self.armed = false;
        self.connection.deregister(self.correlation_id)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.connection.deregister(self.correlation_id);
        }
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.member() {
            None => write!(f, "Connection[{}]({})", self.inner.id, self.inner.address),
            Some(member) => write!(f, "Connection[{}]({}, {})", self.inner.id, self.inner.address, member),
        }
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("member", &self.member())
            .field("alive", &self.is_alive())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}
