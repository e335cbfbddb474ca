use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5701;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    /// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`. A missing port
    /// falls back to [`DEFAULT_PORT`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("empty address"));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or(anyhow!("unterminated ipv6 address `{}`", s))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().with_context(|| format!("invalid port in `{}`", s))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(anyhow!("invalid address `{}`", s)),
            };
            return Ok(Address::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Ok(Address::new(s, DEFAULT_PORT)),
            Some((host, port)) => {
                let port = port.parse().with_context(|| format!("invalid port in `{}`", s))?;
                Ok(Address::new(host, port))
            }
            None => Ok(Address::new(s, DEFAULT_PORT)),
        }
    }
}

/// Where a member can be reached. `address` is what the cluster advertises
/// internally, `public` is set when clients outside the private network must
/// use a different address.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub address: Address,
    pub public: Option<Address>,
}

impl Endpoint {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            public: None,
        }
    }

    pub fn with_public(address: Address, public: Address) -> Self {
        Self {
            address,
            public: Some(public),
        }
    }

    pub fn connect_address(&self) -> &Address {
        self.public.as_ref().unwrap_or(&self.address)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.public {
            None => write!(f, "{}", self.address),
            Some(public) => write!(f, "{}(public {})", self.address, public),
        }
    }
}
