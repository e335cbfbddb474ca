use bincode::{Decode, Encode};

use crate::address::Address;

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct AuthRequest {
    pub cluster_name: String,
    pub client_uuid: u128,
    pub client_name: String,
    pub token: Option<String>,
    pub smart_routing: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Encode, Decode)]
pub enum AuthStatus {
    Authenticated,
    CredentialsFailed,
    NotAllowedInCluster,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct AuthResponse {
    pub status: AuthStatus,
    pub member_uuid: u128,
    pub cluster_id: u128,
    pub address: Address,
    pub partition_count: u32,
}
