use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use grid_core::address::Address;
use grid_core::config::client_config::ClientConfig;
use grid_core::config::ConfigBuilder;
use grid_core::message::cluster_view::{ClusterViewEvent, MemberInfo};

use crate::member::{MemberContext, MemberStats, Shared};
use crate::tls::{TlsMaterial, TlsMode};

#[derive(Debug, TypedBuilder)]
pub struct ClusterOptions {
    #[builder(default = 2)]
    members: usize,
    #[builder(default = "dev".to_string(), setter(into))]
    cluster_name: String,
    #[builder(default = 271)]
    partition_count: u32,
    #[builder(default, setter(strip_option))]
    tls: Option<TlsMode>,
    /// Members advertise 10.47.0.x addresses instead of the loopback one
    /// they listen on, the way members behind a NAT do.
    #[builder(default)]
    private_addresses: bool,
    #[builder(default, setter(strip_option, into))]
    token: Option<String>,
}

struct MemberHandle {
    uuid: Uuid,
    port: u16,
    advertised: Address,
    stats: Arc<MemberStats>,
    stop: CancellationToken,
    accept: JoinHandle<()>,
}

struct ClusterState {
    cluster_id: Uuid,
    version: u64,
    next_index: usize,
    members: Vec<MemberHandle>,
    stopped_ports: Vec<u16>,
}

pub(crate) struct ClusterInner {
    shared: Arc<Shared>,
    private_addresses: bool,
    state: Mutex<ClusterState>,
}

impl ClusterInner {
    /// (advertised, public) address of every running member.
    pub(crate) fn endpoints(&self) -> Vec<(Address, Address)> {
        self.state
            .lock()
            .members
            .iter()
            .map(|m| (m.advertised.clone(), Address::new("127.0.0.1", m.port)))
            .collect()
    }
}

/// A cluster of in-process members sharing one storage. Partitions are
/// assigned round robin over the members in join order.
pub struct TestCluster {
    inner: Arc<ClusterInner>,
    tls: Option<TlsMaterial>,
}

impl TestCluster {
    pub async fn start(options: ClusterOptions) -> anyhow::Result<Self> {
        let tls = options.tls.map(TlsMaterial::generate).transpose()?;
        let (views, _) = watch::channel(ClusterViewEvent {
            version: 0,
            members: vec![],
            partitions: vec![],
        });
        let shared = Shared {
            cluster_name: options.cluster_name,
            token: options.token,
            partition_count: options.partition_count,
            storage: DashMap::new(),
            views,
            tls: tls.as_ref().map(TlsMaterial::acceptor),
        };
        let cluster = Self {
            inner: Arc::new(ClusterInner {
                shared: Arc::new(shared),
                private_addresses: options.private_addresses,
                state: Mutex::new(ClusterState {
                    cluster_id: Uuid::new_v4(),
                    version: 0,
                    next_index: 0,
                    members: vec![],
                    stopped_ports: vec![],
                }),
            }),
            tls,
        };
        {
            let mut state = cluster.inner.state.lock();
            for _ in 0..options.members {
                cluster.spawn_member(&mut state, 0)?;
            }
            cluster.publish(&mut state);
        }
        info!("test cluster started with {} members", options.members);
        Ok(cluster)
    }

    pub(crate) fn inner(&self) -> &Arc<ClusterInner> {
        &self.inner
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    pub fn cluster_name(&self) -> &str {
        &self.inner.shared.cluster_name
    }

    pub fn cluster_id(&self) -> Uuid {
        self.inner.state.lock().cluster_id
    }

    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    pub fn members(&self) -> Vec<Uuid> {
        self.inner.state.lock().members.iter().map(|m| m.uuid).collect()
    }

    /// Addresses the members put in cluster views.
    pub fn advertised_addresses(&self) -> Vec<Address> {
        self.inner.endpoints().into_iter().map(|(advertised, _)| advertised).collect()
    }

    /// Loopback addresses the members listen on.
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.endpoints().into_iter().map(|(_, public)| public).collect()
    }

    pub fn member_stats(&self) -> Vec<(Uuid, Arc<MemberStats>)> {
        self.inner
            .state
            .lock()
            .members
            .iter()
            .map(|m| (m.uuid, m.stats.clone()))
            .collect()
    }

    pub fn operations(&self) -> u64 {
        self.member_stats().iter().map(|(_, stats)| stats.operations()).sum()
    }

    pub fn foreign_operations(&self) -> u64 {
        self.member_stats().iter().map(|(_, stats)| stats.foreign_operations()).sum()
    }

    /// Number of entries stored under `map` across the cluster.
    pub fn map_size(&self, map: &str) -> usize {
        self.inner.shared.storage.get(map).map(|m| m.len()).unwrap_or(0)
    }

    /// Grows or shrinks the cluster to `target` members. Leaving members are
    /// announced to the survivors before they stop.
    pub async fn scale(&self, target: usize) -> anyhow::Result<()> {
        let leaving = {
            let mut state = self.inner.state.lock();
            while state.members.len() < target {
                self.spawn_member(&mut state, 0)?;
            }
            let keep = target.min(state.members.len());
            let leaving = state.members.split_off(keep);
            self.publish(&mut state);
            leaving
        };
        Self::stop_members(leaving).await;
        info!("test cluster scaled to {} members", target);
        Ok(())
    }

    /// Stops every member, remembering their ports for `resume`.
    pub async fn stop(&self) {
        let members = {
            let mut state = self.inner.state.lock();
            let members = std::mem::take(&mut state.members);
            state.stopped_ports = members.iter().map(|m| m.port).collect();
            members
        };
        Self::stop_members(members).await;
        info!("test cluster stopped");
    }

    /// Restarts the cluster on the same ports as a brand new cluster: new
    /// cluster id, new member uuids, versions counting from the start again.
    pub async fn resume(&self) -> anyhow::Result<()> {
        let mut state = self.inner.state.lock();
        state.cluster_id = Uuid::new_v4();
        state.version = 0;
        for port in std::mem::take(&mut state.stopped_ports) {
            self.spawn_member(&mut state, port)?;
        }
        self.publish(&mut state);
        info!("test cluster resumed as {}", state.cluster_id);
        Ok(())
    }

    /// Client config pointing at this cluster, with TLS material when the
    /// cluster runs TLS.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::builder().build()?;
        config.cluster_name = self.cluster_name().to_string();
        config.network.addresses = self.addresses().iter().map(ToString::to_string).collect();
        config.network.connection_timeout_millis = 2000;
        config.network.heartbeat_interval_millis = 500;
        config.connection_retry.initial_backoff_millis = 100;
        config.connection_retry.max_backoff_millis = 500;
        config.connection_retry.cluster_connect_timeout_millis = 10_000;
        config.invocation.timeout_millis = 10_000;
        config.invocation.retry_pause_millis = 100;
        if let Some(tls) = &self.tls {
            let ssl = &mut config.network.ssl;
            ssl.enabled = true;
            ssl.ca_path = Some(tls.ca_path.clone());
            ssl.cert_path = tls.client_cert_path.clone();
            ssl.key_path = tls.client_key_path.clone();
            ssl.server_name = Some("localhost".to_string());
        }
        Ok(config)
    }

    fn spawn_member(&self, state: &mut ClusterState, port: u16) -> anyhow::Result<()> {
        let index = state.next_index;
        state.next_index += 1;
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        let listener = socket.listen(1024)?;
        let port = listener.local_addr()?.port();
        let advertised = if self.inner.private_addresses {
            Address::new(format!("10.47.0.{}", index % 250 + 1), port)
        } else {
            Address::new("127.0.0.1", port)
        };
        let context = Arc::new(MemberContext {
            uuid: Uuid::new_v4(),
            cluster_id: state.cluster_id,
            advertised: advertised.clone(),
            shared: self.inner.shared.clone(),
            stats: Arc::new(MemberStats::default()),
            stop: CancellationToken::new(),
        });
        let handle = MemberHandle {
            uuid: context.uuid,
            port,
            advertised,
            stats: context.stats.clone(),
            stop: context.stop.clone(),
            accept: tokio::spawn(context.clone().accept_loop(listener)),
        };
        info!("member {} listening on 127.0.0.1:{}", handle.advertised, port);
        state.members.push(handle);
        Ok(())
    }

    fn publish(&self, state: &mut ClusterState) {
        state.version += 1;
        let members: Vec<MemberInfo> = state
            .members
            .iter()
            .map(|m| MemberInfo {
                uuid: m.uuid.as_u128(),
                address: m.advertised.clone(),
            })
            .collect();
        let partitions = if members.is_empty() {
            vec![]
        } else {
            (0..self.inner.shared.partition_count as usize)
                .map(|p| members[p % members.len()].uuid)
                .collect()
        };
        self.inner.shared.views.send_replace(ClusterViewEvent {
            version: state.version,
            members,
            partitions,
        });
    }

    async fn stop_members(members: Vec<MemberHandle>) {
        for member in &members {
            member.stop.cancel();
        }
        for member in members {
            let _ = member.accept.await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for member in self.inner.state.lock().members.iter() {
            member.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::{ClusterOptions, TestCluster};

    #[tokio::test]
    async fn test_scale_bumps_version() -> anyhow::Result<()> {
        let cluster = TestCluster::start(ClusterOptions::builder().members(2).build()).await?;
        assert_eq!(cluster.version(), 1);
        cluster.scale(4).await?;
        assert_eq!(cluster.size(), 4);
        assert_eq!(cluster.version(), 2);
        cluster.scale(1).await?;
        assert_eq!(cluster.size(), 1);
        assert_eq!(cluster.version(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_is_a_new_cluster() -> anyhow::Result<()> {
        let cluster = TestCluster::start(ClusterOptions::builder().members(2).build()).await?;
        let id = cluster.cluster_id();
        let addresses = cluster.addresses();
        cluster.stop().await;
        assert_eq!(cluster.size(), 0);
        cluster.resume().await?;
        assert_ne!(cluster.cluster_id(), id);
        assert_eq!(cluster.version(), 1);
        assert_eq!(cluster.addresses(), addresses);
        Ok(())
    }
}
