//! Configuration loading from `config.toml` with defaults.

use parley_types::config::{ChatConfig, PeerSpec};
use parley_types::peer::Peer;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file used when none is given on the command line.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("config.toml")
}

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file is logged and replaced by
/// [`ChatConfig::default`]; loading never fails.
pub fn load_config(path: Option<&Path>) -> ChatConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return ChatConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ChatConfig>(&contents) {
            Ok(config) => {
                info!(
                    path = %config_path.display(),
                    peers = config.peers.len(),
                    "Loaded configuration"
                );
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                ChatConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            ChatConfig::default()
        }
    }
}

/// Turn configured peer entries into dialable peers.
///
/// Entries that do not parse are skipped with a warning.
pub fn resolve_peers(specs: &[PeerSpec]) -> Vec<Peer> {
    specs
        .iter()
        .filter_map(|spec| match spec.address().parse::<Peer>() {
            Ok(peer) => Some(match spec.name() {
                Some(name) => peer.with_name(name),
                None => peer,
            }),
            Err(e) => {
                warn!(entry = spec.address(), error = %e, "Skipping invalid peer entry");
                None
            }
        })
        .collect()
}
