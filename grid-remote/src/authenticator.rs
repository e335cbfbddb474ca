use std::time::Duration;

use typed_builder::TypedBuilder;
use uuid::Uuid;

use grid_core::error::ClientError;
use grid_core::message::auth::{AuthRequest, AuthResponse, AuthStatus};
use grid_core::message::error::ErrorResponse;
use grid_core::message::{ClientMessage, CorrelationIds, OpCode};

use crate::connection::Connection;

#[derive(Debug, Clone, TypedBuilder)]
pub struct Authenticator {
    #[builder(setter(into))]
    cluster_name: String,
    client_uuid: Uuid,
    #[builder(setter(into))]
    client_name: String,
    #[builder(default)]
    token: Option<String>,
    smart_routing: bool,
}

impl Authenticator {
    pub fn client_uuid(&self) -> Uuid {
        self.client_uuid
    }

    fn request(&self) -> AuthRequest {
        AuthRequest {
            cluster_name: self.cluster_name.clone(),
            client_uuid: self.client_uuid.as_u128(),
            client_name: self.client_name.clone(),
            token: self.token.clone(),
            smart_routing: self.smart_routing,
        }
    }

    /// First exchange on a fresh connection. A connection that breaks or stays
    /// silent during the exchange is reported as a connect failure so the
    /// caller moves on to the next candidate.
    pub async fn authenticate(
        &self,
        connection: &Connection,
        correlation_ids: &CorrelationIds,
        timeout: Duration,
    ) -> Result<AuthResponse, ClientError> {
        let mut request = ClientMessage::request(OpCode::Authenticate, &self.request())?;
        let correlation_id = correlation_ids.next_id();
        request.correlation_id = correlation_id;
        let address = connection.address().clone();
        let rx = connection.send(request).await?;
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(error))) => {
                return Err(ClientError::Connect {
                    address,
                    reason: format!("authentication interrupted: {}", error),
                });
            }
            Ok(Err(_)) => {
                return Err(ClientError::Connect {
                    address,
                    reason: "authentication interrupted".to_string(),
                });
            }
            Err(_) => {
                connection.deregister(correlation_id);
                return Err(ClientError::ConnectTimeout { address, timeout });
            }
        };
        if response.op == OpCode::Error {
            let error: ErrorResponse = response.decode_payload()?;
            return Err(ClientError::Authentication {
                address,
                reason: error.message,
            });
        }
        let auth: AuthResponse = response.decode_payload()?;
        match auth.status {
            AuthStatus::Authenticated => {
                connection.bind(auth.clone());
                Ok(auth)
            }
            status => Err(ClientError::Authentication {
                address,
                reason: format!("{:?}", status),
            }),
        }
    }
}
