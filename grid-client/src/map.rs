use std::marker::PhantomData;

use bincode::{Decode, Encode};

use grid_core::error::ClientError;
use grid_core::ext::{decode_bytes, encode_bytes};
use grid_core::message::map::{BoolResponse, MapKeyRequest, MapNameRequest, MapPutRequest, SizeResponse, ValueResponse};
use grid_core::message::{ClientMessage, OpCode};
use grid_core::partition::partition_id;

use crate::client::Client;
use crate::invocation::Invocation;
use crate::routing::InvocationTarget;

/// Distributed map proxy. Keys and values travel bincode encoded, keys are
/// routed by the partition their encoded bytes hash to.
///
/// Mutations are idempotent per key and are resent when the connection
/// carrying them broke.
pub struct Map<K, V> {
    name: String,
    client: Client,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            client: self.client.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> Map<K, V>
where
    K: Encode,
    V: Encode + Decode<()>,
{
    pub(crate) fn new(name: String, client: Client) -> Self {
        Self {
            name,
            client,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn encode<T: Encode>(value: &T) -> Result<Vec<u8>, ClientError> {
        encode_bytes(value).map_err(ClientError::serialization)
    }

    fn decode_value(response: &ClientMessage) -> Result<Option<V>, ClientError> {
        let response: ValueResponse = response.decode_payload()?;
        response
            .value
            .map(|bytes| decode_bytes::<V>(&bytes).map_err(ClientError::serialization))
            .transpose()
    }

    fn keyed(&self, key: &[u8], mut message: ClientMessage) -> Invocation {
        let count = self.client.partition_count();
        let target = if count > 0 {
            let partition = partition_id(key, count);
            message.partition_id = partition;
            InvocationTarget::Partition(partition)
        } else {
            InvocationTarget::Any
        };
        Invocation::new(message, target).idempotent(true)
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>, ClientError> {
        let key = Self::encode(key)?;
        let request = MapPutRequest {
            name: self.name.clone(),
            key: key.clone(),
            value: Self::encode(value)?,
        };
        let message = ClientMessage::request(OpCode::MapPut, &request)?;
        let response = self.client.invoke(self.keyed(&key, message)).await?;
        Self::decode_value(&response)
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>, ClientError> {
        let key = Self::encode(key)?;
        let message = ClientMessage::request(OpCode::MapGet, &self.key_request(&key))?;
        let response = self.client.invoke(self.keyed(&key, message)).await?;
        Self::decode_value(&response)
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>, ClientError> {
        let key = Self::encode(key)?;
        let message = ClientMessage::request(OpCode::MapRemove, &self.key_request(&key))?;
        let response = self.client.invoke(self.keyed(&key, message)).await?;
        Self::decode_value(&response)
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool, ClientError> {
        let key = Self::encode(key)?;
        let message = ClientMessage::request(OpCode::MapContainsKey, &self.key_request(&key))?;
        let response = self.client.invoke(self.keyed(&key, message)).await?;
        let response: BoolResponse = response.decode_payload()?;
        Ok(response.value)
    }

    pub async fn size(&self) -> Result<u64, ClientError> {
        let message = ClientMessage::request(OpCode::MapSize, &self.name_request())?;
        let response = self.client.invoke(Invocation::new(message, InvocationTarget::Any)).await?;
        let response: SizeResponse = response.decode_payload()?;
        Ok(response.size)
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        let message = ClientMessage::request(OpCode::MapClear, &self.name_request())?;
        let invocation = Invocation::new(message, InvocationTarget::Any).idempotent(true);
        self.client.invoke(invocation).await?;
        Ok(())
    }

    fn key_request(&self, key: &[u8]) -> MapKeyRequest {
        MapKeyRequest {
            name: self.name.clone(),
            key: key.to_vec(),
        }
    }

    fn name_request(&self) -> MapNameRequest {
        MapNameRequest {
            name: self.name.clone(),
        }
    }
}
