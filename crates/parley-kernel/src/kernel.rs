//! ChatKernel: assembles and owns the running node.

use crate::config::resolve_peers;
use crate::error::{KernelError, KernelResult};
use parley_bus::EventBus;
use parley_types::config::ChatConfig;
use parley_types::peer::Peer;
use parley_wire::message::MAX_NAME_LEN;
use parley_wire::{PeerConfig, PeerNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A booted chat node: its bus, its peer node and the background tasks.
pub struct ChatKernel {
    config: ChatConfig,
    bus: Arc<EventBus>,
    node: Arc<PeerNode>,
    accept_task: JoinHandle<()>,
    dial_task: JoinHandle<usize>,
}

impl ChatKernel {
    /// Boot a node on a fresh event bus.
    pub async fn boot(config: ChatConfig) -> KernelResult<Self> {
        Self::boot_with_bus(config, EventBus::new()).await
    }

    /// Boot a node on an existing bus, so a frontend can subscribe before
    /// the first connection is made.
    ///
    /// Binds the listener and starts dialing the configured peers in the
    /// background. Fails if the name is too long to announce or the listen
    /// address cannot be bound.
    pub async fn boot_with_bus(config: ChatConfig, bus: Arc<EventBus>) -> KernelResult<Self> {
        let name = config.name.trim();
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::BootFailed(format!(
                "name is {} bytes, the limit is {MAX_NAME_LEN}",
                name.len()
            )));
        }
        let node_name = (!name.is_empty()).then(|| name.to_string());

        let listen_addr = SocketAddr::new(config.listen_host, config.port);
        let peer_config = PeerConfig {
            listen_addr,
            node_name,
            peers: resolve_peers(&config.peers),
            dial_timeout: config.dial_timeout_secs.map(Duration::from_secs),
        };

        let (node, accept_task) = PeerNode::start(peer_config, Arc::clone(&bus))
            .await
            .map_err(|e| KernelError::BootFailed(format!("cannot listen on {listen_addr}: {e}")))?;

        let dialer = Arc::clone(&node);
        let dial_task = tokio::spawn(async move { dialer.connect_to_configured_peers().await });

        info!(
            name = %config.name,
            listen = %node.local_addr(),
            "Kernel booted"
        );

        Ok(Self {
            config,
            bus,
            node,
            accept_task,
            dial_task,
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn node(&self) -> &Arc<PeerNode> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    /// Dial an additional peer.
    pub async fn connect(&self, peer: &Peer) -> KernelResult<()> {
        self.node.connect_to_peer(peer).await?;
        Ok(())
    }

    /// Stop the node, wait for every session to tear down, then shut the
    /// bus down.
    pub async fn shutdown(self) {
        info!("Shutting down kernel");
        self.node.shutdown();

        // The dial pass sees the shutdown and stops before its next write.
        if let Err(e) = self.dial_task.await {
            warn!(error = %e, "Dial pass ended abnormally");
        }

        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        self.node.wait_sessions().await;
        self.bus.shutdown();
        info!("Kernel stopped");
    }
}
