//! Remote endpoints a node knows about.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing an `"ip:port"` peer entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerParseError {
    /// The entry has no `:` separating address and port.
    #[error("missing ':' between address and port in '{0}'")]
    MissingPort(String),
    /// The address part is not an IPv4 or IPv6 address.
    #[error("invalid IP address '{0}'")]
    InvalidAddress(String),
    /// The port part is not a number in `0..=65535`.
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// A configured or discovered remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Display name hint, if the configuration provided one.
    pub name: Option<String>,
    /// IP address of the peer.
    pub address: IpAddr,
    /// TCP port the peer listens on.
    pub port: u16,
}

impl Peer {
    /// Create an unnamed peer.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            name: None,
            address,
            port,
        }
    }

    /// Attach a display name hint.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.socket_addr()),
            None => write!(f, "{}", self.socket_addr()),
        }
    }
}

impl FromStr for Peer {
    type Err = PeerParseError;

    /// Parse `ip:port`. IPv6 addresses may be written bracketed (`[::1]:2504`)
    /// or bare (`::1:2504`, split at the last colon).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerParseError::MissingPort(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let address = host
            .parse::<IpAddr>()
            .map_err(|_| PeerParseError::InvalidAddress(host.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| PeerParseError::InvalidPort(port.to_string()))?;
        Ok(Self::new(address, port))
    }
}
