use std::time::Duration;

use config::builder::DefaultState;
use config::{File, FileFormat, Source, Value};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::config::network::NetworkConfig;
use crate::config::retry::{ConnectionRetryConfig, InvocationConfig};
use crate::config::ConfigBuilder;
use crate::error::ClientError;
use crate::REFERENCE_CONFIG;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub cluster_name: String,
    pub client_name: Option<String>,
    pub statistics: StatisticsConfig,
    pub network: NetworkConfig,
    pub connection_retry: ConnectionRetryConfig,
    pub invocation: InvocationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub period_millis: u64,
}

impl StatisticsConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_millis)
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn static_addresses(&self) -> crate::error::Result<Vec<Address>> {
        self.network
            .addresses
            .iter()
            .map(|address| {
                address
                    .parse::<Address>()
                    .map_err(|error| ClientError::Config(format!("{:#}", error)))
            })
            .collect()
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let network = &self.network;
        if self.cluster_name.trim().is_empty() {
            return Err(ClientError::config("cluster_name must not be empty"));
        }
        if network.cloud.enabled {
            let token = network.cloud.discovery_token.as_deref().unwrap_or_default();
            if token.trim().is_empty() {
                return Err(ClientError::config("cloud discovery requires a discovery_token"));
            }
            if !network.addresses.is_empty() {
                return Err(ClientError::config(
                    "static addresses and cloud discovery cannot be used together",
                ));
            }
        }
        self.static_addresses()?;
        let ssl = &network.ssl;
        if ssl.cert_path.is_some() != ssl.key_path.is_some() {
            return Err(ClientError::config("ssl cert_path and key_path must be set together"));
        }
        let timeouts = [
            ("network.connection_timeout_millis", network.connection_timeout_millis),
            ("network.heartbeat_interval_millis", network.heartbeat_interval_millis),
            ("network.heartbeat_timeout_millis", network.heartbeat_timeout_millis),
            ("invocation.timeout_millis", self.invocation.timeout_millis),
            (
                "connection_retry.cluster_connect_timeout_millis",
                self.connection_retry.cluster_connect_timeout_millis,
            ),
            ("statistics.period_millis", self.statistics.period_millis),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ClientError::Config(format!("{} must be greater than zero", name)));
        }
        if !(0.0..=1.0).contains(&self.connection_retry.jitter) {
            return Err(ClientError::config("connection_retry.jitter must be within [0, 1]"));
        }
        if self.connection_retry.multiplier < 1.0 {
            return Err(ClientError::config("connection_retry.multiplier must be at least 1.0"));
        }
        Ok(())
    }
}

/// Layers user sources over the bundled reference configuration.
#[derive(Debug)]
pub struct ClientConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
    overrides: Vec<(String, Value)>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        let builder = config::Config::builder().add_source(File::from_str(REFERENCE_CONFIG, FileFormat::Toml));
        Self {
            builder,
            overrides: Vec::new(),
        }
    }
}

impl ClientConfigBuilder {
    pub fn set<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: Into<Value>,
    {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn add_toml(self, toml: &str) -> crate::error::Result<Self> {
        self.add_source(File::from_str(toml, FileFormat::Toml))
    }
}

impl ConfigBuilder for ClientConfigBuilder {
    type C = ClientConfig;

    fn add_source<T>(self, source: T) -> crate::error::Result<Self>
    where
        T: Source + Send + Sync + 'static,
    {
        Ok(Self {
            builder: self.builder.add_source(source),
            overrides: self.overrides,
        })
    }

    fn build(self) -> crate::error::Result<Self::C> {
        let mut builder = self.builder;
        for (key, value) in self.overrides {
            builder = builder.set_override(key, value)?;
        }
        let config = builder.build()?.try_deserialize::<ClientConfig>()?;
        config.validate()?;
        Ok(config)
    }
}
