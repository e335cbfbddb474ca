use bincode::{Decode, Encode};

use crate::address::Address;

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct MemberInfo {
    pub uuid: u128,
    pub address: Address,
}

/// Pushed by members after authentication and on every topology change.
/// `partitions[i]` is the uuid of the owner of partition `i`; empty means the
/// table is not known yet.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ClusterViewEvent {
    pub version: u64,
    pub members: Vec<MemberInfo>,
    pub partitions: Vec<u128>,
}
