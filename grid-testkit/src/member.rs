use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use grid_core::address::Address;
use grid_core::ext::encode_bytes;
use grid_core::message::auth::{AuthRequest, AuthResponse, AuthStatus};
use grid_core::message::cluster_view::ClusterViewEvent;
use grid_core::message::error::{ErrorCode, ErrorResponse};
use grid_core::message::map::{
    BoolResponse, MapKeyRequest, MapNameRequest, MapPutRequest, SizeResponse, ValueResponse,
};
use grid_core::message::{ClientMessage, OpCode, NO_PARTITION};
use grid_remote::codec::MessageCodec;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Requests served by one member.
#[derive(Debug, Default)]
pub struct MemberStats {
    operations: AtomicU64,
    foreign_operations: AtomicU64,
}

impl MemberStats {
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Partition bound requests for partitions this member does not own.
    pub fn foreign_operations(&self) -> u64 {
        self.foreign_operations.load(Ordering::Relaxed)
    }
}

/// State every member of one cluster shares.
pub(crate) struct Shared {
    pub(crate) cluster_name: String,
    pub(crate) token: Option<String>,
    pub(crate) partition_count: u32,
    pub(crate) storage: DashMap<String, DashMap<Vec<u8>, Vec<u8>>>,
    pub(crate) views: watch::Sender<ClusterViewEvent>,
    pub(crate) tls: Option<TlsAcceptor>,
}

pub(crate) struct MemberContext {
    pub(crate) uuid: Uuid,
    pub(crate) cluster_id: Uuid,
    pub(crate) advertised: Address,
    pub(crate) shared: Arc<Shared>,
    pub(crate) stats: Arc<MemberStats>,
    pub(crate) stop: CancellationToken,
}

impl MemberContext {
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("member {} accepted {}", self.advertised, peer);
                        let context = self.clone();
                        tokio::spawn(async move {
                            if let Err(error) = context.serve_stream(stream).await {
                                debug!("member {} connection from {} ended: {:?}", context.advertised, peer, error);
                            }
                        });
                    }
                    Err(error) => {
                        warn!("member {} accept error {:?}", self.advertised, error);
                        break;
                    }
                }
            }
        }
    }

    async fn serve_stream(&self, stream: TcpStream) -> anyhow::Result<()> {
        match &self.shared.tls {
            Some(acceptor) => {
                let stream = tokio::select! {
                    _ = self.stop.cancelled() => return Ok(()),
                    stream = acceptor.accept(stream) => stream?,
                };
                self.serve(stream).await
            }
            None => self.serve(stream).await,
        }
    }

    async fn serve<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, MessageCodec::new(MAX_FRAME_SIZE));
        let mut views = self.shared.views.subscribe();
        let mut authenticated = false;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                changed = views.changed(), if authenticated => {
                    if changed.is_err() {
                        break;
                    }
                    let event = views.borrow_and_update().clone();
                    framed.send(ClientMessage::event(OpCode::ClusterView, &event)?).await?;
                }
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let request = frame?;
                    if request.op == OpCode::Authenticate {
                        let auth = self.authenticate(&request)?;
                        let accepted = auth.status == AuthStatus::Authenticated;
                        framed.send(ClientMessage::response(request.correlation_id, &auth)?).await?;
                        if !accepted {
                            break;
                        }
                        authenticated = true;
                        let event = views.borrow_and_update().clone();
                        framed.send(ClientMessage::event(OpCode::ClusterView, &event)?).await?;
                    } else if !authenticated {
                        warn!("member {} got {} before authentication", self.advertised, request);
                        break;
                    } else {
                        let response = self.handle(&request)?;
                        framed.send(response).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn authenticate(&self, request: &ClientMessage) -> anyhow::Result<AuthResponse> {
        let auth: AuthRequest = request.decode_payload()?;
        let status = if auth.cluster_name != self.shared.cluster_name {
            AuthStatus::NotAllowedInCluster
        } else if self.shared.token.is_some() && auth.token != self.shared.token {
            AuthStatus::CredentialsFailed
        } else {
            AuthStatus::Authenticated
        };
        debug!("member {} authenticated client {}: {:?}", self.advertised, auth.client_name, status);
        Ok(AuthResponse {
            status,
            member_uuid: self.uuid.as_u128(),
            cluster_id: self.cluster_id.as_u128(),
            address: self.advertised.clone(),
            partition_count: self.shared.partition_count,
        })
    }

    fn owns(&self, partition_id: i32) -> bool {
        let view = self.shared.views.borrow();
        view.partitions
            .get(partition_id as usize)
            .map(|owner| *owner == self.uuid.as_u128())
            .unwrap_or(false)
    }

    fn handle(&self, request: &ClientMessage) -> anyhow::Result<ClientMessage> {
        self.stats.operations.fetch_add(1, Ordering::Relaxed);
        if request.partition_id != NO_PARTITION && !self.owns(request.partition_id) {
            self.stats.foreign_operations.fetch_add(1, Ordering::Relaxed);
        }
        let correlation_id = request.correlation_id;
        let storage = &self.shared.storage;
        match request.op {
            OpCode::Ping => ClientMessage::response(correlation_id, &()),
            OpCode::MapPut => {
                let put: MapPutRequest = request.decode_payload()?;
                let value = storage.entry(put.name).or_default().insert(put.key, put.value);
                ClientMessage::response(correlation_id, &ValueResponse { value })
            }
            OpCode::MapGet => {
                let get: MapKeyRequest = request.decode_payload()?;
                let value = self.get(&get.name, &get.key);
                ClientMessage::response(correlation_id, &ValueResponse { value })
            }
            OpCode::MapRemove => {
                let remove: MapKeyRequest = request.decode_payload()?;
                let value = match storage.get(&remove.name) {
                    Some(map) => map.remove(&remove.key).map(|(_, value)| value),
                    None => None,
                };
                ClientMessage::response(correlation_id, &ValueResponse { value })
            }
            OpCode::MapContainsKey => {
                let contains: MapKeyRequest = request.decode_payload()?;
                let value = self.get(&contains.name, &contains.key).is_some();
                ClientMessage::response(correlation_id, &BoolResponse { value })
            }
            OpCode::MapSize => {
                let size: MapNameRequest = request.decode_payload()?;
                let size = match storage.get(&size.name) {
                    Some(map) => map.len() as u64,
                    None => 0,
                };
                ClientMessage::response(correlation_id, &SizeResponse { size })
            }
            OpCode::MapClear => {
                let clear: MapNameRequest = request.decode_payload()?;
                if let Some(map) = storage.get(&clear.name) {
                    map.clear();
                }
                ClientMessage::response(correlation_id, &())
            }
            op => {
                let error = ErrorResponse {
                    code: ErrorCode::UnknownOperation,
                    message: format!("{:?} is not a request", op),
                };
                Ok(ClientMessage {
                    correlation_id,
                    op: OpCode::Error,
                    flags: 0,
                    partition_id: NO_PARTITION,
                    payload: encode_bytes(&error)?,
                })
            }
        }
    }

    fn get(&self, name: &str, key: &[u8]) -> Option<Vec<u8>> {
        let map = self.shared.storage.get(name)?;
        let value = map.get(key)?;
        Some(value.value().clone())
    }
}
