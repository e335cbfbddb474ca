use bincode::{Decode, Encode};

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct MapPutRequest {
    pub name: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct MapKeyRequest {
    pub name: String,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct MapNameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ValueResponse {
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SizeResponse {
    pub size: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct BoolResponse {
    pub value: bool,
}
