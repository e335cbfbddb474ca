use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use grid_core::address::{Address, DEFAULT_PORT};
use grid_core::config::client_config::ClientConfig;
use grid_core::error::ClientError;

const DISCOVERY_PATH: &str = "/cluster/discovery";

/// Source of candidate member addresses used to seed a connection attempt.
#[async_trait]
pub trait AddressProvider: Send + Sync + Debug {
    async fn load_addresses(&self) -> Result<Vec<Address>, ClientError>;

    /// Address this client should dial for an address the cluster advertises,
    /// `None` when they are the same or the mapping is not known yet.
    fn translate(&self, address: &Address) -> Option<Address>;

    /// Whether `load_addresses` also refreshes what `translate` knows.
    fn translates(&self) -> bool {
        false
    }
}

pub fn address_provider(config: &ClientConfig) -> Result<Arc<dyn AddressProvider>, ClientError> {
    let cloud = &config.network.cloud;
    if cloud.enabled {
        let token = cloud.discovery_token.as_deref().unwrap_or_default();
        let discovery = CloudDiscovery::new(&cloud.url_base, token, config.network.connection_timeout())?;
        return Ok(Arc::new(discovery));
    }
    Ok(Arc::new(StaticAddressProvider::new(config.static_addresses()?)))
}

#[derive(Debug)]
pub struct StaticAddressProvider {
    addresses: Vec<Address>,
}

impl StaticAddressProvider {
    /// An empty list falls back to a member on localhost.
    pub fn new(addresses: Vec<Address>) -> Self {
        let addresses = if addresses.is_empty() {
            vec![Address::new("127.0.0.1", DEFAULT_PORT)]
        } else {
            addresses.into_iter().unique().collect()
        };
        Self { addresses }
    }
}

#[async_trait]
impl AddressProvider for StaticAddressProvider {
    async fn load_addresses(&self) -> Result<Vec<Address>, ClientError> {
        Ok(self.addresses.clone())
    }

    fn translate(&self, _address: &Address) -> Option<Address> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveredNode {
    #[serde(rename = "private-address")]
    private_address: String,
    #[serde(rename = "public-address")]
    public_address: String,
}

/// Resolves member addresses through an HTTP discovery endpoint keyed by a
/// token. Members advertise private addresses, the endpoint maps each of them
/// to the public address this client dials.
#[derive(Debug)]
pub struct CloudDiscovery {
    client: reqwest::Client,
    endpoint: Url,
    private_to_public: ArcSwap<HashMap<Address, Address>>,
}

impl CloudDiscovery {
    pub fn new(url_base: &str, token: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut endpoint = Url::parse(url_base)
            .and_then(|base| base.join(DISCOVERY_PATH))
            .map_err(|e| ClientError::Config(format!("invalid discovery url {}: {}", url_base, e)))?;
        endpoint.query_pairs_mut().append_pair("token", token);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Discovery(format!("build http client error {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            private_to_public: ArcSwap::from_pointee(HashMap::new()),
        })
    }

    async fn discover(&self) -> Result<HashMap<Address, Address>, ClientError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| ClientError::Discovery(format!("request {} error {}", self.endpoint.path(), e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Discovery(format!("discovery endpoint answered {}", status)));
        }
        let nodes: Vec<DiscoveredNode> = response
            .json()
            .await
            .map_err(|e| ClientError::Discovery(format!("invalid discovery response {}", e)))?;
        parse_nodes(nodes)
    }
}

fn parse_nodes(nodes: Vec<DiscoveredNode>) -> Result<HashMap<Address, Address>, ClientError> {
    let mut addresses = HashMap::with_capacity(nodes.len());
    for node in nodes {
        let public: Address = node
            .public_address
            .parse()
            .map_err(|e| ClientError::Discovery(format!("invalid public address {}: {}", node.public_address, e)))?;
        let private = Address::new(node.private_address.trim(), public.port);
        addresses.insert(private, public);
    }
    if addresses.is_empty() {
        return Err(ClientError::Discovery("discovery returned no members".to_string()));
    }
    Ok(addresses)
}

#[async_trait]
impl AddressProvider for CloudDiscovery {
    async fn load_addresses(&self) -> Result<Vec<Address>, ClientError> {
        let addresses = self.discover().await?;
        debug!("discovered {} members", addresses.len());
        let public = addresses.values().cloned().sorted().collect();
        self.private_to_public.store(Arc::new(addresses));
        Ok(public)
    }

    fn translate(&self, address: &Address) -> Option<Address> {
        let translated = self.private_to_public.load().get(address).cloned();
        if translated.is_none() {
            info!("no public address known for {}", address);
        }
        translated
    }

    fn translates(&self) -> bool {
        true
    }
}
