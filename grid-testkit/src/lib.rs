//! In-process cluster members speaking the client wire protocol, used to
//! drive the client through topology changes, restarts and TLS setups.

pub mod cluster;
pub mod discovery;
mod member;
pub mod tls;

pub use cluster::{ClusterOptions, TestCluster};
pub use discovery::DiscoveryServer;
pub use member::MemberStats;
pub use tls::{TlsMaterial, TlsMode};
