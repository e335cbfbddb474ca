use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use grid_core::address::Address;
use grid_core::error::ClientError;
use grid_core::member::Member;
use grid_core::message::{ClientMessage, CorrelationIds};

use crate::authenticator::Authenticator;
use crate::codec::MessageCodec;
use crate::connection::{Connection, ConnectionEvent};
use crate::transport::Transport;

#[derive(Debug)]
pub enum RegistryEvent {
    Event {
        connection: Connection,
        message: ClientMessage,
    },
    /// An admitted connection died. `remaining` counts live connections left.
    ConnectionClosed {
        connection: Connection,
        member: Uuid,
        reason: String,
        remaining: usize,
    },
}

/// Live authenticated connections, at most one per member.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transport: Transport,
    authenticator: Authenticator,
    correlation_ids: Arc<CorrelationIds>,
    codec: MessageCodec,
    connections: Arc<DashMap<Uuid, Connection>>,
    connecting: DashMap<Address, Arc<Mutex<()>>>,
    next_connection_id: AtomicU64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    active: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(
        transport: Transport,
        authenticator: Authenticator,
        correlation_ids: Arc<CorrelationIds>,
        max_frame_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(DashMap::new());
        tokio::spawn(Self::pump(connections.clone(), events_rx, registry_tx));
        let registry = Self {
            inner: Arc::new(RegistryInner {
                transport,
                authenticator,
                correlation_ids,
                codec: MessageCodec::new(max_frame_size),
                connections,
                connecting: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                events: events_tx,
                active: AtomicBool::new(true),
            }),
        };
        (registry, registry_rx)
    }

    async fn pump(
        connections: Arc<DashMap<Uuid, Connection>>,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        tx: mpsc::UnboundedSender<RegistryEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let event = match event {
                ConnectionEvent::Event { connection, message } => RegistryEvent::Event { connection, message },
                ConnectionEvent::Closed { connection, reason } => {
                    let Some(member) = connection.member() else {
                        continue;
                    };
                    if connections.remove_if(&member, |_, c| c == &connection).is_none() {
                        debug!("{} was never admitted or already replaced", connection);
                        continue;
                    }
                    RegistryEvent::ConnectionClosed {
                        connection,
                        member,
                        reason,
                        remaining: connections.len(),
                    }
                }
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn client_uuid(&self) -> Uuid {
        self.inner.authenticator.client_uuid()
    }

    /// Returns the live connection to `member`, opening one if needed.
    pub async fn connect(&self, member: &Member) -> Result<Connection, ClientError> {
        if let Some(connection) = self.get(&member.uuid) {
            return Ok(connection);
        }
        let address = member.connect_address();
        let slot = self.connect_slot(address);
        let _guard = slot.acquire().await;
        if let Some(connection) = self.get(&member.uuid) {
            return Ok(connection);
        }
        let connection = self.open(address).await?;
        if connection.member() != Some(member.uuid) {
            let reason = format!(
                "expected member {} but {:?} answered",
                member.uuid,
                connection.member()
            );
            connection.close(reason.clone());
            return Err(ClientError::Connect {
                address: address.clone(),
                reason,
            });
        }
        self.admit(connection)
    }

    /// Connects to an address whose member is not known yet, returns the
    /// existing connection when that address is already connected.
    pub async fn connect_to_address(&self, address: &Address) -> Result<Connection, ClientError> {
        let slot = self.connect_slot(address);
        let _guard = slot.acquire().await;
        if let Some(connection) = self.find_by_address(address) {
            return Ok(connection);
        }
        let connection = self.open(address).await?;
        self.admit(connection)
    }

    fn connect_slot(&self, address: &Address) -> ConnectSlot<'_> {
        let lock = self.inner.connecting.entry(address.clone()).or_default().clone();
        ConnectSlot {
            connecting: &self.inner.connecting,
            address: address.clone(),
            lock: Some(lock),
        }
    }

    async fn open(&self, address: &Address) -> Result<Connection, ClientError> {
        if !self.is_active() {
            return Err(ClientError::ClientNotActive);
        }
        let stream = self.inner.transport.connect(address).await?;
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::spawn(
            id,
            address.clone(),
            stream,
            self.inner.codec,
            self.inner.events.clone(),
        );
        let result = self
            .inner
            .authenticator
            .authenticate(
                &connection,
                &self.inner.correlation_ids,
                self.inner.transport.connect_timeout(),
            )
            .await;
        match result {
            Ok(_) => Ok(connection),
            Err(error) => {
                connection.close(format!("authentication failed: {}", error));
                Err(error)
            }
        }
    }

    fn admit(&self, connection: Connection) -> Result<Connection, ClientError> {
        let member = connection.member().ok_or(ClientError::Connect {
            address: connection.address().clone(),
            reason: "connection is not authenticated".to_string(),
        })?;
        let existing = match self.inner.connections.entry(member) {
            Entry::Occupied(entry) if entry.get().is_alive() => Some(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                entry.insert(connection.clone());
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                None
            }
        };
        if let Some(existing) = existing {
            connection.close("duplicate connection");
            return Ok(existing);
        }
        if !self.is_active() {
            self.inner.connections.remove_if(&member, |_, c| c == &connection);
            connection.close("client is shutting down");
            return Err(ClientError::ClientNotActive);
        }
        info!("{} admitted, {} live connections", connection, self.inner.connections.len());
        Ok(connection)
    }

    pub fn get(&self, member: &Uuid) -> Option<Connection> {
        self.inner
            .connections
            .get(member)
            .map(|c| c.value().clone())
            .filter(|c| c.is_alive())
    }

    fn find_by_address(&self, address: &Address) -> Option<Connection> {
        self.inner
            .connections
            .iter()
            .find(|c| c.address() == address && c.is_alive())
            .map(|c| c.value().clone())
    }

    pub fn disconnect(&self, member: &Uuid, reason: &str) -> bool {
        match self.inner.connections.remove(member) {
            Some((_, connection)) => {
                connection.close(reason);
                true
            }
            None => false,
        }
    }

    /// Snapshot of live connections ordered by connection id, safe to iterate
    /// while connections come and go.
    pub fn all(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|c| c.value().clone())
            .filter(|c| c.is_alive())
            .collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn close_all(&self, reason: &str) {
        self.inner.active.store(false, Ordering::SeqCst);
        let members: Vec<Uuid> = self.inner.connections.iter().map(|c| *c.key()).collect();
        for member in members {
            self.disconnect(&member, reason);
        }
    }
}

/// Serializes connection attempts to one address. The map entry is removed
/// by the last attempt that held it, including one cancelled while waiting.
struct ConnectSlot<'a> {
    connecting: &'a DashMap<Address, Arc<Mutex<()>>>,
    address: Address,
    lock: Option<Arc<Mutex<()>>>,
}

impl ConnectSlot<'_> {
    async fn acquire(&self) -> Option<OwnedMutexGuard<()>> {
        let lock = self.lock.clone()?;
        Some(lock.lock_owned().await)
    }
}

impl Drop for ConnectSlot<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.connecting.remove_if(&self.address, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;
    use uuid::Uuid;

    use grid_core::address::{Address, Endpoint};
    use grid_core::member::Member;
    use grid_core::message::auth::{AuthResponse, AuthStatus};
    use grid_core::message::{ClientMessage, CorrelationIds, OpCode};

    use crate::authenticator::Authenticator;
    use crate::codec::MessageCodec;
    use crate::registry::{ConnectionRegistry, RegistryEvent};
    use crate::transport::Transport;

    /// Accepts connections and authenticates them as `member`, closing each
    /// after `hold`.
    async fn fake_member(member: Uuid, hold: Duration) -> anyhow::Result<(Address, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = Address::new("127.0.0.1", listener.local_addr()?.port());
        let advertised = address.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let advertised = advertised.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, MessageCodec::new(1 << 20));
                    let deadline = tokio::time::sleep(hold);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            _ = &mut deadline => break,
                            frame = framed.next() => {
                                let Some(Ok(request)) = frame else { break };
                                if request.op == OpCode::Authenticate {
                                    let auth = AuthResponse {
                                        status: AuthStatus::Authenticated,
                                        member_uuid: member.as_u128(),
                                        cluster_id: 1,
                                        address: advertised.clone(),
                                        partition_count: 271,
                                    };
                                    let Ok(response) = ClientMessage::response(request.correlation_id, &auth) else { break };
                                    if framed.send(response).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });
        Ok((address, handle))
    }

    fn registry() -> (ConnectionRegistry, tokio::sync::mpsc::UnboundedReceiver<RegistryEvent>) {
        let authenticator = Authenticator::builder()
            .cluster_name("dev")
            .client_uuid(Uuid::new_v4())
            .client_name("test")
            .smart_routing(true)
            .build();
        ConnectionRegistry::new(
            Transport::plain(Duration::from_secs(2)),
            authenticator,
            Arc::new(CorrelationIds::new()),
            1 << 20,
        )
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() -> anyhow::Result<()> {
        let uuid = Uuid::new_v4();
        let (address, _server) = fake_member(uuid, Duration::from_secs(60)).await?;
        let (registry, _events) = registry();
        let member = Member::new(uuid, Endpoint::new(address.clone()));
        let (a, b) = tokio::join!(registry.connect(&member), registry.connect(&member));
        let (a, b) = (a?, b?);
        assert_eq!(a, b);
        assert_eq!(registry.connect_to_address(&address).await?, a);
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.get(&uuid), Some(a));
        Ok(())
    }

    #[tokio::test]
    async fn test_member_mismatch_rejected() -> anyhow::Result<()> {
        let (address, _server) = fake_member(Uuid::new_v4(), Duration::from_secs(60)).await?;
        let (registry, _events) = registry();
        let member = Member::new(Uuid::new_v4(), Endpoint::new(address));
        assert!(registry.connect(&member).await.is_err());
        assert!(registry.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_connection_removed_and_reported() -> anyhow::Result<()> {
        let uuid = Uuid::new_v4();
        let (address, _server) = fake_member(uuid, Duration::from_millis(300)).await?;
        let (registry, mut events) = registry();
        let connection = registry.connect_to_address(&address).await?;
        assert_eq!(connection.member(), Some(uuid));
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await? {
            Some(RegistryEvent::ConnectionClosed { member, remaining, .. }) => {
                assert_eq!(member, uuid);
                assert_eq!(remaining, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(registry.get(&uuid).is_none());
        assert!(registry.all().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_all() -> anyhow::Result<()> {
        let uuid = Uuid::new_v4();
        let (address, _server) = fake_member(uuid, Duration::from_secs(60)).await?;
        let (registry, _events) = registry();
        let connection = registry.connect_to_address(&address).await?;
        registry.close_all("shutdown");
        assert!(!connection.is_alive());
        assert!(registry.is_empty());
        assert!(registry.connect_to_address(&address).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_locks_are_released() -> anyhow::Result<()> {
        let uuid = Uuid::new_v4();
        let (address, _server) = fake_member(uuid, Duration::from_secs(60)).await?;
        let (registry, _events) = registry();
        let member = Member::new(uuid, Endpoint::new(address.clone()));
        let (a, b) = tokio::join!(registry.connect(&member), registry.connect_to_address(&address));
        a?;
        b?;
        assert!(registry.inner.connecting.is_empty());

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let refused = Address::new("127.0.0.1", listener.local_addr()?.port());
        drop(listener);
        for _ in 0..3 {
            assert!(registry.connect_to_address(&refused).await.is_err());
        }
        assert!(registry.inner.connecting.is_empty());

        let waiting = registry.connect_slot(&address);
        let held = waiting.acquire().await;
        let cancelled = tokio::time::timeout(Duration::from_millis(50), registry.connect_to_address(&address)).await;
        assert!(cancelled.is_err());
        assert_eq!(registry.inner.connecting.len(), 1);
        drop(held);
        drop(waiting);
        assert!(registry.inner.connecting.is_empty());
        Ok(())
    }
}
