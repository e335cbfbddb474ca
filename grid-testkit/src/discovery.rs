use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cluster::{ClusterInner, TestCluster};

const DISCOVERY_PATH: &str = "/cluster/discovery";

/// HTTP endpoint answering `GET /cluster/discovery?token=..` with the private
/// and public address of every running member.
pub struct DiscoveryServer {
    address: SocketAddr,
    requests: Arc<AtomicU64>,
    delay_millis: Arc<AtomicU64>,
    stop: CancellationToken,
}

#[derive(Clone)]
struct DiscoveryState {
    cluster: Arc<ClusterInner>,
    token: Arc<str>,
    requests: Arc<AtomicU64>,
    delay_millis: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryQuery {
    token: Option<String>,
}

impl DiscoveryServer {
    pub async fn start(cluster: &TestCluster, token: impl Into<String>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let requests = Arc::new(AtomicU64::new(0));
        let delay_millis = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();
        let state = DiscoveryState {
            cluster: cluster.inner().clone(),
            token: Arc::from(token.into()),
            requests: requests.clone(),
            delay_millis: delay_millis.clone(),
        };
        let app = Router::new().route(DISCOVERY_PATH, get(discover)).with_state(state);
        let shutdown = stop.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = server.await {
                error!("discovery server error {:?}", e);
            }
            debug!("discovery server on {} stopped", address);
        });
        Ok(Self {
            address,
            requests,
            delay_millis,
            stop,
        })
    }

    pub fn url_base(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Holds every following answer back for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_millis.store(delay.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn discover(State(state): State<DiscoveryState>, Query(query): Query<DiscoveryQuery>) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let delay = state.delay_millis.load(Ordering::Relaxed);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if query.token.as_deref() != Some(&*state.token) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "invalid token" }))).into_response();
    }
    let nodes: Vec<_> = state
        .cluster
        .endpoints()
        .into_iter()
        .map(|(private, public)| {
            json!({
                "private-address": private.host,
                "public-address": public.to_string(),
            })
        })
        .collect();
    Json(nodes).into_response()
}
