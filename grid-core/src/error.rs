use std::time::Duration;

use thiserror::Error;

use crate::address::Address;
use crate::message::error::{ErrorCode, ErrorResponse};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("connect to {address} failed: {reason}")]
    Connect { address: Address, reason: String },
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: Address, timeout: Duration },
    #[error("tls handshake with {address} failed: {reason}")]
    TlsHandshake { address: Address, reason: String },
    #[error("invalid tls configuration: {0}")]
    TlsConfig(String),
    #[error("authentication rejected by {address}: {reason}")]
    Authentication { address: Address, reason: String },
    #[error("invocation timed out after {elapsed:?}, last error: {last_error}")]
    InvocationTimeout { elapsed: Duration, last_error: String },
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),
    #[error("no connection available: {0}")]
    ConnectionUnavailable(String),
    #[error("target disconnected: {0}")]
    TargetDisconnected(String),
    #[error("remote error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("client is not active")]
    ClientNotActive,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn serialization(error: anyhow::Error) -> Self {
        ClientError::Serialization(format!("{:#}", error))
    }

    pub fn config(error: impl std::fmt::Display) -> Self {
        ClientError::Config(error.to_string())
    }

    /// Errors after which resending the same request cannot cause a duplicate
    /// side effect. `TargetDisconnected` is excluded: the request may have been
    /// applied before the connection broke.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::ConnectTimeout { .. }
            | ClientError::ConnectionUnavailable(_) => true,
            ClientError::Remote { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(
            self,
            ClientError::TlsHandshake { .. } | ClientError::TlsConfig(_)
        )
    }
}

impl From<ErrorResponse> for ClientError {
    fn from(value: ErrorResponse) -> Self {
        ClientError::Remote {
            code: value.code,
            message: value.message,
        }
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(value: config::ConfigError) -> Self {
        ClientError::Config(value.to_string())
    }
}
