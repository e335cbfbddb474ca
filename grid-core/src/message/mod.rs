use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use bincode::{Decode, Encode};

use crate::error::ClientError;
use crate::ext::{decode_bytes, encode_bytes};

pub mod auth;
pub mod cluster_view;
pub mod error;
pub mod map;

pub const EVENT_FLAG: u8 = 0b0000_0001;
pub const NO_PARTITION: i32 = -1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Encode, Decode)]
pub enum OpCode {
    Authenticate,
    Ping,
    MapPut,
    MapGet,
    MapRemove,
    MapContainsKey,
    MapSize,
    MapClear,
    Response,
    Error,
    ClusterView,
}

impl OpCode {
    /// Read-only ops are safe to resend after the target disconnected.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OpCode::Ping | OpCode::MapGet | OpCode::MapContainsKey | OpCode::MapSize
        )
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ClientMessage {
    pub correlation_id: u64,
    pub op: OpCode,
    pub flags: u8,
    pub partition_id: i32,
    pub payload: Vec<u8>,
}

impl ClientMessage {
    pub fn request<P>(op: OpCode, payload: &P) -> Result<Self, ClientError>
    where
        P: Encode,
    {
        let payload = encode_bytes(payload).map_err(ClientError::serialization)?;
        Ok(Self {
            correlation_id: 0,
            op,
            flags: 0,
            partition_id: NO_PARTITION,
            payload,
        })
    }

    pub fn response<P>(correlation_id: u64, payload: &P) -> anyhow::Result<Self>
    where
        P: Encode,
    {
        Ok(Self {
            correlation_id,
            op: OpCode::Response,
            flags: 0,
            partition_id: NO_PARTITION,
            payload: encode_bytes(payload)?,
        })
    }

    pub fn event<P>(op: OpCode, payload: &P) -> anyhow::Result<Self>
    where
        P: Encode,
    {
        Ok(Self {
            correlation_id: 0,
            op,
            flags: EVENT_FLAG,
            partition_id: NO_PARTITION,
            payload: encode_bytes(payload)?,
        })
    }

    pub fn is_event(&self) -> bool {
        self.flags & EVENT_FLAG != 0
    }

    pub fn decode_payload<P>(&self) -> Result<P, ClientError>
    where
        P: Decode<()>,
    {
        decode_bytes(&self.payload).map_err(ClientError::serialization)
    }
}

impl Display for ClientMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClientMessage {{ correlation_id: {}, op: {:?}, partition_id: {}, payload: {} bytes }}",
            self.correlation_id,
            self.op,
            self.partition_id,
            self.payload.len()
        )
    }
}

/// Correlation ids are unique per client, shared by every connection.
#[derive(Debug)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::message::map::MapKeyRequest;
    use crate::message::{ClientMessage, CorrelationIds, OpCode, EVENT_FLAG, NO_PARTITION};

    #[test]
    fn test_request_payload() -> anyhow::Result<()> {
        let request = MapKeyRequest {
            name: "m".to_string(),
            key: vec![1, 2],
        };
        let message = ClientMessage::request(OpCode::MapGet, &request)?;
        assert_eq!(message.partition_id, NO_PARTITION);
        assert!(!message.is_event());
        let decoded: MapKeyRequest = message.decode_payload()?;
        assert_eq!(decoded, request);
        Ok(())
    }

    #[test]
    fn test_event_flag() -> anyhow::Result<()> {
        let event = ClientMessage::event(OpCode::ClusterView, &1u64)?;
        assert_eq!(event.flags & EVENT_FLAG, EVENT_FLAG);
        assert!(event.is_event());
        Ok(())
    }

    #[test]
    fn test_correlation_ids_unique() {
        let ids = CorrelationIds::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(first >= 1);
        assert_ne!(first, second);
    }

    #[test]
    fn test_retryable_ops() {
        assert!(OpCode::MapGet.is_retryable());
        assert!(!OpCode::MapPut.is_retryable());
        assert!(!OpCode::MapClear.is_retryable());
    }
}
