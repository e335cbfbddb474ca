use std::sync::Arc;
use std::time::Duration;

use rustls::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use grid_core::address::Address;
use grid_core::config::network::NetworkConfig;
use grid_core::error::ClientError;

use crate::tls::{client_config, MaybeTlsStream};

/// Opens byte streams to members, TLS wrapped when configured. There is no
/// fallback to plaintext once TLS is configured.
#[derive(Clone)]
pub struct Transport {
    tls: Option<TlsConnector>,
    server_name: Option<String>,
    connect_timeout: Duration,
}

impl Transport {
    pub fn new(network: &NetworkConfig) -> Result<Self, ClientError> {
        let tls = client_config(&network.ssl)?.map(TlsConnector::from);
        Ok(Self {
            tls,
            server_name: network.ssl.server_name.clone(),
            connect_timeout: network.connection_timeout(),
        })
    }

    pub fn plain(connect_timeout: Duration) -> Self {
        Self {
            tls: None,
            server_name: None,
            connect_timeout,
        }
    }

    pub fn with_tls(config: Arc<rustls::ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: Some(TlsConnector::from(config)),
            server_name: None,
            connect_timeout,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// TCP connect plus TLS handshake, both bounded by the connect timeout.
    pub async fn connect(&self, address: &Address) -> Result<MaybeTlsStream, ClientError> {
        match tokio::time::timeout(self.connect_timeout, self.establish(address)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout {
                address: address.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    async fn establish(&self, address: &Address) -> Result<MaybeTlsStream, ClientError> {
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| ClientError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| ClientError::Connect {
            address: address.clone(),
            reason: format!("set tcp nodelay error {}", e),
        })?;
        let Some(connector) = &self.tls else {
            return Ok(MaybeTlsStream::Plain(stream));
        };
        let host = self.server_name.as_deref().unwrap_or(address.host.as_str());
        let server_name = ServerName::try_from(host)
            .map_err(|e| ClientError::TlsConfig(format!("invalid server name {}: {}", host, e)))?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsHandshake {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        debug!("tls handshake with {} completed", address);
        Ok(MaybeTlsStream::Tls(Box::new(stream)))
    }
}
