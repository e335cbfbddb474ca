use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use grid_client::{Client, ClientConfig};
use grid_core::config::ConfigBuilder;
use grid_core::ext::init_logger_with_filter;
use grid_testkit::{ClusterOptions, TestCluster};

/// Connects to a cluster and runs put/get rounds against one map.
#[derive(Parser, Debug)]
struct Args {
    /// Toml file layered over the reference configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    address: Vec<String>,
    #[arg(long)]
    cluster_name: Option<String>,
    #[arg(long)]
    unisocket: bool,
    #[arg(long)]
    discovery_token: Option<String>,
    #[arg(long)]
    discovery_url: Option<String>,
    #[arg(long)]
    ssl_ca: Option<PathBuf>,
    #[arg(long)]
    ssl_cert: Option<PathBuf>,
    #[arg(long)]
    ssl_key: Option<PathBuf>,
    #[arg(long)]
    ssl_key_passphrase: Option<String>,
    /// Run against an in-process cluster of this many members.
    #[arg(long)]
    embedded: Option<usize>,
    #[arg(long, default_value = "smoke")]
    map: String,
    #[arg(long, default_value_t = 100)]
    count: u32,
    #[arg(long, default_value_t = 10)]
    rounds: u32,
    #[arg(long, default_value_t = 1000)]
    interval_millis: u64,
}

fn client_config(args: &Args, embedded: Option<&TestCluster>) -> anyhow::Result<ClientConfig> {
    let mut config = match (embedded, &args.config) {
        (Some(cluster), _) => cluster.client_config()?,
        (None, Some(path)) => ClientConfig::builder().add_toml(&std::fs::read_to_string(path)?)?.build()?,
        (None, None) => ClientConfig::builder().build()?,
    };
    if let Some(cluster_name) = &args.cluster_name {
        config.cluster_name = cluster_name.clone();
    }
    if !args.address.is_empty() {
        config.network.addresses = args.address.clone();
    }
    if args.unisocket {
        config.network.smart_routing = false;
    }
    if let Some(token) = &args.discovery_token {
        config.network.addresses.clear();
        config.network.cloud.enabled = true;
        config.network.cloud.discovery_token = Some(token.clone());
        if let Some(url) = &args.discovery_url {
            config.network.cloud.url_base = url.clone();
        }
    }
    if args.ssl_ca.is_some() {
        let ssl = &mut config.network.ssl;
        ssl.enabled = true;
        ssl.ca_path = args.ssl_ca.clone();
        ssl.cert_path = args.ssl_cert.clone();
        ssl.key_path = args.ssl_key.clone();
        ssl.key_passphrase = args.ssl_key_passphrase.clone();
    }
    config.statistics.enabled = true;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger_with_filter("info");
    let embedded = match args.embedded {
        Some(members) => Some(TestCluster::start(ClusterOptions::builder().members(members).build()).await?),
        None => None,
    };
    let config = client_config(&args, embedded.as_ref())?;
    let client = Client::start(config).await?;
    info!("client {} connected, members {:?}", client.name(), client.members());
    let map = client.get_map::<u32, u64>(args.map.clone());
    for round in 0..args.rounds {
        let started = Instant::now();
        let mut failures = 0;
        for key in 0..args.count {
            let value = rand::thread_rng().gen::<u64>();
            match map.put(&key, &value).await {
                Ok(_) => {}
                Err(error) => {
                    failures += 1;
                    warn!("put {} failed: {}", key, error);
                    continue;
                }
            }
            match map.get(&key).await {
                Ok(Some(read)) if read == value => {}
                Ok(read) => warn!("get {} returned {:?}, expected {}", key, read, value),
                Err(error) => {
                    failures += 1;
                    warn!("get {} failed: {}", key, error);
                }
            }
        }
        let size = map.size().await.unwrap_or_default();
        info!(
            "round {} done in {:?}: {} failures, map size {}, state {}",
            round,
            started.elapsed(),
            failures,
            size,
            client.state()
        );
        tokio::time::sleep(Duration::from_millis(args.interval_millis)).await;
    }
    info!("{:?}", client.statistics());
    client.shutdown();
    Ok(())
}
