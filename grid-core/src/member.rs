use std::fmt::{Display, Formatter};

use uuid::Uuid;

use crate::address::{Address, Endpoint};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemberState {
    Connecting,
    Connected,
    Left,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Member {
    pub uuid: Uuid,
    pub endpoint: Endpoint,
    pub state: MemberState,
}

impl Member {
    pub fn new(uuid: Uuid, endpoint: Endpoint) -> Self {
        Self {
            uuid,
            endpoint,
            state: MemberState::Connecting,
        }
    }

    pub fn address(&self) -> &Address {
        &self.endpoint.address
    }

    pub fn connect_address(&self) -> &Address {
        self.endpoint.connect_address()
    }

    pub fn with_state(&self, state: MemberState) -> Self {
        let mut member = self.clone();
        member.state = state;
        member
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member[{}]:{}", self.endpoint, self.uuid)
    }
}
