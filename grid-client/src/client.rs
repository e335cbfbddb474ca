use std::sync::Arc;
use std::time::{Duration, Instant};

use bincode::{Decode, Encode};
use itertools::Itertools;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use grid_core::address::Address;
use grid_core::cluster_view::ClusterView;
use grid_core::config::client_config::ClientConfig;
use grid_core::error::ClientError;
use grid_core::member::{Member, MemberState};
use grid_core::message::cluster_view::ClusterViewEvent;
use grid_core::message::{ClientMessage, CorrelationIds, OpCode};
use grid_remote::authenticator::Authenticator;
use grid_remote::connection::Connection;
use grid_remote::registry::{ConnectionRegistry, RegistryEvent};
use grid_remote::transport::Transport;

use crate::discovery::{address_provider, AddressProvider};
use crate::invocation::{Invocation, InvocationService};
use crate::map::Map;
use crate::membership::{ClientState, MembershipTracker};
use crate::routing::{InvocationTarget, Router, TRouter};
use crate::statistics::{Statistics, StatisticsSnapshot};

/// Handle to a running client. Clones share the same connections and state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    uuid: Uuid,
    name: String,
    registry: ConnectionRegistry,
    tracker: Arc<MembershipTracker>,
    invocation: InvocationService,
    provider: Arc<dyn AddressProvider>,
    statistics: Arc<Statistics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connects to the cluster described by `config`. Fails when no member
    /// can be reached within the connection budget, when TLS material is
    /// unusable, or when the cluster rejects the client.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = Transport::new(&config.network)?;
        let provider = address_provider(&config)?;
        let uuid = Uuid::new_v4();
        let name = config
            .client_name
            .clone()
            .unwrap_or_else(|| format!("grid-client-{}", &uuid.simple().to_string()[..8]));
        let cloud = &config.network.cloud;
        let authenticator = Authenticator::builder()
            .cluster_name(config.cluster_name.clone())
            .client_uuid(uuid)
            .client_name(name.clone())
            .token(cloud.discovery_token.clone().filter(|_| cloud.enabled))
            .smart_routing(config.network.smart_routing)
            .build();
        let correlation_ids = Arc::new(CorrelationIds::new());
        let (registry, events) = ConnectionRegistry::new(
            transport,
            authenticator,
            correlation_ids.clone(),
            config.network.max_frame_size,
        );
        let tracker = Arc::new(MembershipTracker::new());
        let statistics = Arc::new(Statistics::default());
        let invocation = InvocationService::new(
            config.invocation.clone(),
            config.network.redo_operation,
            correlation_ids,
            registry.clone(),
            Router::new(config.network.smart_routing),
            tracker.clone(),
            statistics.clone(),
        );
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                uuid,
                name,
                registry,
                tracker,
                invocation,
                provider,
                statistics,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        client.spawn(client.clone().event_loop(events));
        info!(
            "client {} starting, cluster {}, smart routing {}",
            client.inner.name, client.inner.config.cluster_name, client.inner.config.network.smart_routing
        );
        client.inner.tracker.start()?;
        if let Err(error) = client.connect_to_cluster(true).await {
            error!("client {} failed to connect to the cluster {:?}", client.inner.name, error);
            client.inner.tracker.connect_failed();
            client.shutdown();
            return Err(error);
        }
        client.inner.tracker.mark_connected();
        client.spawn(client.clone().maintenance_loop());
        if client.inner.config.statistics.enabled {
            client.spawn(client.clone().statistics_loop());
        }
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClientState {
        self.inner.tracker.state()
    }

    pub fn is_active(&self) -> bool {
        !self.inner.tracker.is_shutdown()
    }

    pub fn cluster_view(&self) -> Arc<ClusterView> {
        self.inner.tracker.view()
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.tracker.partition_count()
    }

    /// Members of the current view, `Connected` when this client holds a
    /// live connection to them.
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .tracker
            .view()
            .members
            .iter()
            .map(|member| match self.inner.registry.get(&member.uuid) {
                Some(_) => member.with_state(MemberState::Connected),
                None => member.with_state(MemberState::Connecting),
            })
            .collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.all()
    }

    pub fn router(&self) -> &Router {
        self.inner.invocation.router()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner
            .statistics
            .snapshot(self.inner.registry.len(), self.inner.tracker.view().version)
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        self.inner.tracker.wait_until_connected(timeout).await
    }

    pub fn get_map<K, V>(&self, name: impl Into<String>) -> Map<K, V>
    where
        K: Encode,
        V: Encode + Decode<()>,
    {
        Map::new(name.into(), self.clone())
    }

    pub async fn invoke(&self, invocation: Invocation) -> Result<ClientMessage, ClientError> {
        self.inner.invocation.invoke(invocation).await
    }

    /// Starts a new connection round after the client gave up and went
    /// `Disconnected`.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.inner.tracker.start()?;
        match self.connect_to_cluster(false).await {
            Ok(()) => {
                self.inner.tracker.mark_connected();
                Ok(())
            }
            Err(error) => {
                self.inner.tracker.connect_failed();
                Err(error)
            }
        }
    }

    /// Closes every connection and fails pending invocations. Terminal.
    pub fn shutdown(&self) {
        if !self.inner.tracker.shutdown() {
            return;
        }
        info!("client {} shutting down", self.inner.name);
        self.inner.registry.close_all("client shutdown");
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        if self.inner.tracker.is_shutdown() {
            handle.abort();
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn connect_to_cluster(&self, startup: bool) -> Result<(), ClientError> {
        let retry = &self.inner.config.connection_retry;
        let budget = retry.cluster_connect_timeout();
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut failures = 0usize;
        let mut tls_failures = 0usize;
        let mut last_error: Option<ClientError> = None;
        loop {
            let addresses = match self.candidate_addresses().await {
                Ok(addresses) => addresses,
                Err(error) if startup => return Err(error),
                Err(error) => {
                    warn!("load member addresses error {:?}", error);
                    last_error = Some(error);
                    self.known_member_addresses()
                }
            };
            for address in addresses {
                if self.inner.tracker.is_shutdown() {
                    return Err(ClientError::ClientNotActive);
                }
                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    break;
                }
                match self.try_connect(&address, remaining).await {
                    Ok(()) => return Ok(()),
                    Err(ClientError::ClientNotActive) => return Err(ClientError::ClientNotActive),
                    Err(error @ ClientError::Authentication { .. }) => return Err(error),
                    Err(error) => {
                        warn!("connect to {} failed: {}", address, error);
                        failures += 1;
                        if error.is_tls() {
                            tls_failures += 1;
                        }
                        last_error = Some(error);
                    }
                }
            }
            attempt += 1;
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() || (retry.max_attempts > 0 && attempt >= retry.max_attempts) {
                break;
            }
            let backoff = self.jittered(retry.backoff(attempt - 1)).min(remaining);
            warn!(
                "client {} unable to reach the cluster, attempt {}, next try in {:?}",
                self.inner.name, attempt, backoff
            );
            tokio::time::sleep(backoff).await;
        }
        match last_error {
            Some(error) if failures > 0 && failures == tls_failures => Err(error),
            last_error => Err(ClientError::ClusterUnavailable(format!(
                "unable to connect to cluster {} within {:?} after {} attempts, last error: {}",
                self.inner.config.cluster_name,
                budget,
                attempt,
                last_error.map(|e| e.to_string()).unwrap_or_else(|| "none".to_string())
            ))),
        }
    }

    async fn candidate_addresses(&self) -> Result<Vec<Address>, ClientError> {
        let mut addresses = self.inner.provider.load_addresses().await?;
        addresses.extend(self.known_member_addresses());
        Ok(addresses.into_iter().unique().collect())
    }

    fn known_member_addresses(&self) -> Vec<Address> {
        self.inner
            .tracker
            .view()
            .members
            .iter()
            .map(|member| member.connect_address().clone())
            .collect()
    }

    async fn try_connect(&self, address: &Address, remaining: Duration) -> Result<(), ClientError> {
        let tracker = &self.inner.tracker;
        let seen = tracker.view_syncs();
        let connection = self.inner.registry.connect_to_address(address).await?;
        self.on_connected(&connection);
        let wait = remaining.min(self.inner.config.network.connection_timeout());
        match tracker.wait_for_view(seen, wait).await {
            Ok(()) => Ok(()),
            Err(ClientError::ClientNotActive) => Err(ClientError::ClientNotActive),
            Err(error) => {
                let view = tracker.view();
                if connection.is_alive() && !view.members.is_empty() && view.cluster_id == connection.cluster_id() {
                    Ok(())
                } else {
                    connection.close("no cluster view received");
                    Err(error)
                }
            }
        }
    }

    fn on_connected(&self, connection: &Connection) {
        self.inner.statistics.connection_opened();
        let Some(auth) = connection.auth() else {
            return;
        };
        self.inner.tracker.set_partition_count(auth.partition_count);
        let current = self.inner.tracker.cluster_id();
        if current.is_some() && current != connection.cluster_id() {
            warn!(
                "client {} connected to a different cluster {:?}, previous {:?}",
                self.inner.name,
                connection.cluster_id(),
                current
            );
        }
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let jitter = self.inner.config.connection_retry.jitter;
        if jitter <= 0.0 {
            return backoff;
        }
        let factor = 1.0 + jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        backoff.mul_f64(factor.max(0.0))
    }

    async fn event_loop(self, mut events: UnboundedReceiver<RegistryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Event { connection, message } => match message.op {
                    OpCode::ClusterView => self.handle_cluster_view(&connection, &message),
                    op => debug!("ignore {:?} event from {}", op, connection),
                },
                RegistryEvent::ConnectionClosed {
                    connection,
                    member,
                    reason,
                    remaining,
                } => self.handle_connection_closed(connection, member, reason, remaining),
            }
        }
    }

    fn handle_cluster_view(&self, connection: &Connection, message: &ClientMessage) {
        let event: ClusterViewEvent = match message.decode_payload() {
            Ok(event) => event,
            Err(error) => {
                warn!("decode cluster view from {} error {:?}", connection, error);
                return;
            }
        };
        let cluster_id = connection.cluster_id();
        let provider = &self.inner.provider;
        if provider.translates() && event.members.iter().any(|m| provider.translate(&m.address).is_none()) {
            // discovery round trips run off the event loop, a newer view may overtake this one
            let client = self.clone();
            self.spawn(async move {
                if let Err(error) = client.inner.provider.load_addresses().await {
                    warn!("refresh member addresses error {:?}", error);
                }
                client.install_view(cluster_id, &event);
            });
            return;
        }
        self.install_view(cluster_id, &event);
    }

    fn install_view(&self, cluster_id: Option<Uuid>, event: &ClusterViewEvent) {
        let provider = &self.inner.provider;
        let view = ClusterView::from_event(cluster_id, event, |address| provider.translate(address));
        let Some(delta) = self.inner.tracker.apply_view(view) else {
            return;
        };
        self.inner.statistics.view_applied();
        for member in &delta.removed {
            info!("{} left the cluster", member);
            self.inner.registry.disconnect(&member.uuid, "member left the cluster");
        }
        for member in &delta.added {
            info!("{} joined the cluster", member);
        }
        if self.router().connects_to_all_members() {
            for member in delta.added {
                self.connect_member(member);
            }
        }
    }

    fn handle_connection_closed(&self, connection: Connection, member: Uuid, reason: String, remaining: usize) {
        self.inner.statistics.connection_closed();
        if self.inner.tracker.is_shutdown() {
            return;
        }
        warn!("{} lost: {}, {} connections left", connection, reason, remaining);
        if remaining == 0 {
            if self.inner.tracker.connection_lost() {
                self.spawn(self.clone().reconnect_loop());
            }
            return;
        }
        if self.router().connects_to_all_members() && self.inner.tracker.view().contains(&member) {
            let client = self.clone();
            tokio::spawn(async move {
                client.reresolve_member(member).await;
            });
        }
    }

    /// A member still in the view lost its connection: refresh its address
    /// before dialing it again.
    async fn reresolve_member(&self, member: Uuid) {
        let provider = &self.inner.provider;
        if provider.translates() {
            if let Err(error) = provider.load_addresses().await {
                warn!("refresh member addresses error {:?}", error);
            }
        }
        let view = self.inner.tracker.view();
        let Some(member) = view.member(&member) else {
            return;
        };
        let mut member = member.clone();
        if let Some(public) = provider.translate(member.address()) {
            member.endpoint.public = Some(public);
        }
        self.connect_member(member);
    }

    fn connect_member(&self, member: Member) {
        if self.inner.registry.get(&member.uuid).is_some() {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            match client.inner.registry.connect(&member).await {
                Ok(connection) => {
                    client.inner.statistics.connection_opened();
                    debug!("{} connected to {}", client.inner.name, connection);
                }
                Err(error) => debug!("connect to {} failed: {}", member, error),
            }
        });
    }

    async fn reconnect_loop(self) {
        self.inner.statistics.reconnect_started();
        warn!("client {} lost every connection, reconnecting", self.inner.name);
        loop {
            match self.connect_to_cluster(false).await {
                Ok(()) => {
                    self.inner.tracker.mark_connected();
                    if !self.inner.registry.is_empty() || !self.inner.tracker.connection_lost() {
                        info!("client {} reconnected to the cluster", self.inner.name);
                        break;
                    }
                }
                Err(ClientError::ClientNotActive) => break,
                Err(error) => {
                    error!("client {} gave up reconnecting {:?}", self.inner.name, error);
                    self.inner.tracker.connect_failed();
                    break;
                }
            }
        }
    }

    async fn maintenance_loop(self) {
        let network = &self.inner.config.network;
        let heartbeat_interval = network.heartbeat_interval();
        let heartbeat_timeout = network.heartbeat_timeout();
        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.inner.tracker.is_shutdown() {
                break;
            }
            for connection in self.inner.registry.all() {
                if connection.since_last_read() > heartbeat_timeout {
                    warn!("{} silent for {:?}, closing it", connection, connection.since_last_read());
                    connection.close("heartbeat timed out");
                } else if connection.since_last_write() >= heartbeat_interval {
                    self.ping(connection, heartbeat_timeout);
                }
            }
            if self.inner.tracker.state() != ClientState::Connected {
                continue;
            }
            if self.inner.registry.is_empty() {
                if self.inner.tracker.connection_lost() {
                    self.spawn(self.clone().reconnect_loop());
                }
            } else if self.router().connects_to_all_members() {
                for member in self.inner.tracker.view().members.iter() {
                    self.connect_member(member.clone());
                }
            }
        }
    }

    fn ping(&self, connection: Connection, timeout: Duration) {
        let client = self.clone();
        tokio::spawn(async move {
            let message = match ClientMessage::request(OpCode::Ping, &()) {
                Ok(message) => message,
                Err(error) => {
                    warn!("encode ping error {:?}", error);
                    return;
                }
            };
            let invocation = Invocation::new(message, InvocationTarget::Connection(connection.clone()));
            if let Err(error) = client.inner.invocation.invoke_with_timeout(invocation, timeout).await {
                debug!("ping {} failed: {}", connection, error);
            }
        });
    }

    async fn statistics_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.statistics.period());
        loop {
            interval.tick().await;
            match serde_json::to_string(&self.statistics()) {
                Ok(snapshot) => info!("client {} statistics {}", self.inner.name, snapshot),
                Err(error) => warn!("serialize statistics error {:?}", error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use grid_core::error::ClientError;
    use grid_testkit::{ClusterOptions, DiscoveryServer, TestCluster, TlsMode};

    use crate::client::Client;
    use crate::membership::ClientState;
    use crate::routing::Router;

    async fn eventually<F>(timeout: Duration, condition: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    async fn cluster(members: usize) -> anyhow::Result<TestCluster> {
        TestCluster::start(ClusterOptions::builder().members(members).build()).await
    }

    #[tokio::test]
    async fn test_map_operations() -> anyhow::Result<()> {
        let cluster = cluster(2).await?;
        let client = Client::start(cluster.client_config()?).await?;
        assert_eq!(client.state(), ClientState::Connected);
        let map = client.get_map::<i32, String>("orders");
        for i in 0..20 {
            assert_eq!(map.put(&i, &format!("order-{}", i)).await?, None);
        }
        assert_eq!(map.put(&3, &"changed".to_string()).await?, Some("order-3".to_string()));
        assert_eq!(map.get(&3).await?, Some("changed".to_string()));
        assert_eq!(map.get(&7).await?, Some("order-7".to_string()));
        assert!(map.contains_key(&19).await?);
        assert!(!map.contains_key(&20).await?);
        assert_eq!(map.size().await?, 20);
        assert_eq!(map.remove(&0).await?, Some("order-0".to_string()));
        assert_eq!(map.remove(&0).await?, None);
        assert_eq!(cluster.map_size("orders"), 19);
        map.clear().await?;
        assert_eq!(map.size().await?, 0);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_scale_out_and_in() -> anyhow::Result<()> {
        let cluster = cluster(2).await?;
        let client = Client::start(cluster.client_config()?).await?;
        let map = client.get_map::<i32, i32>("scale");
        let writer = |range: std::ops::Range<i32>| {
            let map = map.clone();
            tokio::spawn(async move {
                for i in range {
                    map.put(&i, &i).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                anyhow::Ok(())
            })
        };

        let puts = writer(0..20);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cluster.scale(4).await?;
        puts.await??;
        assert!(eventually(Duration::from_secs(5), || client.connections().len() == 4).await);
        assert_eq!(client.cluster_view().members.len(), 4);

        let puts = writer(20..40);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cluster.scale(2).await?;
        puts.await??;
        assert!(eventually(Duration::from_secs(5), || client.connections().len() == 2).await);
        assert_eq!(map.size().await?, 40);
        assert_eq!(cluster.map_size("scale"), 40);
        assert!(eventually(Duration::from_secs(5), || client.cluster_view().version == cluster.version()).await);
        assert_eq!(client.state(), ClientState::Connected);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnect_after_cluster_restart() -> anyhow::Result<()> {
        let cluster = cluster(2).await?;
        let client = Client::start(cluster.client_config()?).await?;
        let map = client.get_map::<String, String>("session");
        map.put(&"a".to_string(), &"1".to_string()).await?;
        cluster.stop().await;
        assert!(eventually(Duration::from_secs(5), || client.state() != ClientState::Connected).await);
        cluster.resume().await?;
        client.wait_until_connected(Duration::from_secs(10)).await?;
        assert_eq!(client.cluster_view().cluster_id, Some(cluster.cluster_id()));
        map.put(&"b".to_string(), &"2".to_string()).await?;
        assert_eq!(map.get(&"b".to_string()).await?, Some("2".to_string()));
        assert!(client.statistics().reconnects >= 1);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_gives_up_after_connect_budget() -> anyhow::Result<()> {
        let cluster = cluster(1).await?;
        let mut config = cluster.client_config()?;
        config.connection_retry.cluster_connect_timeout_millis = 1000;
        let client = Client::start(config).await?;
        cluster.stop().await;
        assert!(eventually(Duration::from_secs(10), || client.state() == ClientState::Disconnected).await);
        let result = client.get_map::<i32, i32>("m").get(&1).await;
        assert!(matches!(result, Err(ClientError::ClusterUnavailable(_))), "{:?}", result);
        assert!(matches!(
            client.wait_until_connected(Duration::from_millis(100)).await,
            Err(ClientError::ClusterUnavailable(_))
        ));
        cluster.resume().await?;
        client.reconnect().await?;
        assert_eq!(client.state(), ClientState::Connected);
        client.get_map::<i32, i32>("m").put(&1, &1).await?;
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_invocation_timeout() -> anyhow::Result<()> {
        let cluster = cluster(1).await?;
        let mut config = cluster.client_config()?;
        config.invocation.timeout_millis = 1000;
        config.connection_retry.cluster_connect_timeout_millis = 30_000;
        let client = Client::start(config).await?;
        cluster.stop().await;
        let started = Instant::now();
        let result = client.get_map::<i32, i32>("m").get(&1).await;
        assert!(matches!(result, Err(ClientError::InvocationTimeout { .. })), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(client.statistics().timed_out >= 1);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_unisocket_uses_one_connection() -> anyhow::Result<()> {
        let cluster = cluster(3).await?;
        let mut config = cluster.client_config()?;
        config.network.smart_routing = false;
        let client = Client::start(config).await?;
        assert!(matches!(client.router(), Router::UnisocketRouter(_)));
        let map = client.get_map::<i32, i32>("uni");
        for i in 0..30 {
            map.put(&i, &i).await?;
        }
        assert_eq!(client.connections().len(), 1);
        assert_eq!(client.cluster_view().members.len(), 3);
        assert_eq!(map.size().await?, 30);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_smart_routing_targets_owners() -> anyhow::Result<()> {
        let cluster = cluster(3).await?;
        let client = Client::start(cluster.client_config()?).await?;
        assert!(eventually(Duration::from_secs(5), || client.connections().len() == 3).await);
        assert!(client.cluster_view().partitions.is_known());
        let before = cluster.foreign_operations();
        let map = client.get_map::<i32, i32>("smart");
        for i in 0..50 {
            map.put(&i, &i).await?;
            map.get(&i).await?;
        }
        assert_eq!(cluster.foreign_operations(), before);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_cluster_name_is_fatal() -> anyhow::Result<()> {
        let cluster = cluster(1).await?;
        let mut config = cluster.client_config()?;
        config.cluster_name = "other".to_string();
        let result = Client::start(config).await;
        assert!(matches!(result, Err(ClientError::Authentication { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_mutual_tls() -> anyhow::Result<()> {
        let cluster = TestCluster::start(ClusterOptions::builder().members(2).tls(TlsMode::Mutual).build()).await?;
        let client = Client::start(cluster.client_config()?).await?;
        assert!(client.connections().iter().all(|c| c.is_alive()));
        let map = client.get_map::<i32, String>("secure");
        map.put(&1, &"one".to_string()).await?;
        assert_eq!(map.get(&1).await?, Some("one".to_string()));
        client.shutdown();

        let mut config = cluster.client_config()?;
        config.network.ssl.cert_path = None;
        config.network.ssl.key_path = None;
        config.connection_retry.cluster_connect_timeout_millis = 1000;
        assert!(Client::start(config).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_tls_fails_closed() -> anyhow::Result<()> {
        let cluster = TestCluster::start(ClusterOptions::builder().members(1).tls(TlsMode::Server).build()).await?;

        let mut plaintext = cluster.client_config()?;
        plaintext.network.ssl.enabled = false;
        plaintext.connection_retry.cluster_connect_timeout_millis = 1000;
        let started = Instant::now();
        assert!(Client::start(plaintext).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));

        let mut no_ca = cluster.client_config()?;
        no_ca.network.ssl.ca_path = None;
        assert!(matches!(Client::start(no_ca).await, Err(ClientError::TlsConfig(_))));

        let mut untrusted = cluster.client_config()?;
        if let Some(tls) = cluster.tls() {
            untrusted.network.ssl.ca_path = Some(tls.untrusted_ca()?);
        }
        untrusted.connection_retry.cluster_connect_timeout_millis = 1000;
        let result = Client::start(untrusted).await;
        assert!(matches!(&result, Err(error) if error.is_tls()), "{:?}", result.err());

        let client = Client::start(cluster.client_config()?).await?;
        client.get_map::<i32, i32>("m").put(&1, &1).await?;
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_cloud_discovery_translates_addresses() -> anyhow::Result<()> {
        let cluster = TestCluster::start(
            ClusterOptions::builder()
                .members(2)
                .private_addresses(true)
                .token("s3cr3t")
                .build(),
        )
        .await?;
        let discovery = DiscoveryServer::start(&cluster, "s3cr3t").await?;
        let mut config = cluster.client_config()?;
        config.network.addresses.clear();
        config.network.cloud.enabled = true;
        config.network.cloud.discovery_token = Some("s3cr3t".to_string());
        config.network.cloud.url_base = discovery.url_base();
        let client = Client::start(config.clone()).await?;
        assert!(eventually(Duration::from_secs(5), || client.connections().len() == 2).await);
        for member in client.members() {
            assert!(member.address().host.starts_with("10.47.0."));
            assert_eq!(member.connect_address().host, "127.0.0.1");
        }
        let map = client.get_map::<i32, i32>("cloud");
        map.put(&1, &1).await?;
        assert_eq!(map.get(&1).await?, Some(1));
        assert!(discovery.requests() >= 1);
        client.shutdown();

        config.network.cloud.discovery_token = Some("wrong".to_string());
        assert!(matches!(Client::start(config).await, Err(ClientError::Discovery(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_discovery_does_not_stall_view_updates() -> anyhow::Result<()> {
        let cluster = TestCluster::start(ClusterOptions::builder().members(3).private_addresses(true).build()).await?;
        let discovery = DiscoveryServer::start(&cluster, "s3cr3t").await?;
        let mut config = cluster.client_config()?;
        config.network.addresses.clear();
        config.network.cloud.enabled = true;
        config.network.cloud.discovery_token = Some("s3cr3t".to_string());
        config.network.cloud.url_base = discovery.url_base();
        let client = Client::start(config).await?;
        assert!(eventually(Duration::from_secs(5), || client.connections().len() == 3).await);

        discovery.set_delay(Duration::from_secs(3));
        let requests = discovery.requests();
        cluster.scale(4).await?;
        assert!(eventually(Duration::from_secs(1), || discovery.requests() > requests).await);
        cluster.scale(3).await?;
        assert!(
            eventually(Duration::from_secs(1), || {
                let view = client.cluster_view();
                view.version == cluster.version() && view.members.len() == 3
            })
            .await
        );

        discovery.set_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let view = client.cluster_view();
        assert_eq!(view.version, cluster.version());
        assert_eq!(view.members.len(), 3);
        assert_eq!(client.state(), ClientState::Connected);
        client.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() -> anyhow::Result<()> {
        let cluster = cluster(1).await?;
        let client = Client::start(cluster.client_config()?).await?;
        let map = client.get_map::<i32, i32>("m");
        client.shutdown();
        client.shutdown();
        assert!(!client.is_active());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connections().is_empty());
        assert!(matches!(map.put(&1, &1).await, Err(ClientError::ClientNotActive)));
        Ok(())
    }
}
