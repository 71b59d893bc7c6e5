//! Startup configuration for a chat node.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Display name used when the config does not set one.
pub const DEFAULT_NAME: &str = "Me";

/// Listen port used when the config does not set one.
pub const DEFAULT_PORT: u16 = 2504;

/// One entry of the initial peer list.
///
/// Accepts either a bare `"ip:port"` string or a table with an optional name:
///
/// ```toml
/// peers = ["10.0.0.2:2504", { address = "10.0.0.3:2504", name = "bob" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerSpec {
    /// `"ip:port"`.
    Address(String),
    /// `{ address = "ip:port", name = "..." }`.
    Named {
        /// `"ip:port"`.
        address: String,
        /// Display name hint.
        #[serde(default)]
        name: Option<String>,
    },
}

impl PeerSpec {
    /// The raw `"ip:port"` text of this entry.
    pub fn address(&self) -> &str {
        match self {
            Self::Address(address) | Self::Named { address, .. } => address,
        }
    }

    /// The display name hint, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Address(_) => None,
            Self::Named { name, .. } => name.as_deref(),
        }
    }
}

/// Node configuration, usually loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Local display name announced to peers.
    pub name: String,
    /// TCP port to accept peer connections on.
    pub port: u16,
    /// Interface to bind the listener to.
    pub listen_host: IpAddr,
    /// Peers to dial at startup.
    pub peers: Vec<PeerSpec>,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Per-peer connect timeout. `None` leaves it to the OS.
    pub dial_timeout_secs: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            port: DEFAULT_PORT,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            peers: Vec::new(),
            log_level: "info".to_string(),
            dial_timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.name, "Me");
        assert_eq!(config.port, 2504);
        assert!(config.peers.is_empty());
        assert!(config.dial_timeout_secs.is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ChatConfig = toml::from_str(r#"name = "alice""#).unwrap();
        assert_eq!(config.name, "alice");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_mixed_peer_specs() {
        let config: ChatConfig = toml::from_str(
            r#"
            port = 3000
            peers = ["10.0.0.2:2504", { address = "10.0.0.3:2504", name = "bob" }]
        "#,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].address(), "10.0.0.2:2504");
        assert_eq!(config.peers[0].name(), None);
        assert_eq!(config.peers[1].address(), "10.0.0.3:2504");
        assert_eq!(config.peers[1].name(), Some("bob"));
    }
}
