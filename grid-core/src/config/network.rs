use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    pub smart_routing: bool,
    /// Resend non read-only requests after their connection broke.
    pub redo_operation: bool,
    pub connection_timeout_millis: u64,
    pub heartbeat_interval_millis: u64,
    pub heartbeat_timeout_millis: u64,
    pub max_frame_size: usize,
    pub cloud: CloudConfig,
    pub ssl: SslConfig,
}

impl NetworkConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_millis)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub enabled: bool,
    pub discovery_token: Option<String>,
    pub url_base: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    pub enabled: bool,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
    /// Name checked against the server certificate, defaults to the host
    /// being connected to.
    pub server_name: Option<String>,
}

impl SslConfig {
    pub fn is_mutual(&self) -> bool {
        self.cert_path.is_some() || self.key_path.is_some()
    }
}
