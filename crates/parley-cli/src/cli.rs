//! Command-line arguments.

use clap::Parser;
use parley_types::config::{ChatConfig, PeerSpec};
use std::path::PathBuf;

const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  parley                                   Use ./config.toml
  parley node.toml --name alice            Override the announced name
  parley --port 2600 --peer 10.0.0.2:2504  Listen on 2600 and dial one peer

Type a line and press Enter to send it to every connected peer.
/quit or Ctrl-D leaves the chat.";

/// parley: peer-to-peer terminal chat.
#[derive(Parser, Debug)]
#[command(
    name = "parley",
    version,
    about = "Peer-to-peer terminal chat",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(default_value = "config.toml")]
    pub config: PathBuf,

    /// Display name announced to peers.
    #[arg(long)]
    pub name: Option<String>,

    /// Port to listen on.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Extra peer to dial, as IP:PORT. May be repeated.
    #[arg(long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<String>,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply_overrides(&self, config: &mut ChatConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
            .peers
            .extend(self.peers.iter().cloned().map(PeerSpec::Address));
    }
}
