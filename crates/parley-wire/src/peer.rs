//! PeerNode: TCP listener and dialer for the chat protocol.
//!
//! A [`PeerNode`] binds a local listener and accepts connections from other
//! nodes; it also dials the peers it was configured with. Every connection
//! becomes a [`PeerSession`] owned by the node. Outgoing chat messages arrive
//! as [`FrontendEvent`]s on the bus and are broadcast through the registry.

use crate::error::WireError;
use crate::message::Packet;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::session::{shutdown_signalled, Direction, PeerSession, SessionContext};
use parley_bus::{EventBus, Subscription};
use parley_types::event::FrontendEvent;
use parley_types::peer::Peer;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Configuration for a PeerNode.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Name announced to every peer. `None` skips the `SetName` packet.
    pub node_name: Option<String>,
    /// Peers dialed by [`PeerNode::connect_to_configured_peers`].
    pub peers: Vec<Peer>,
    /// Per-dial connect timeout. `None` leaves it to the OS.
    pub dial_timeout: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            node_name: None,
            peers: Vec::new(),
            dial_timeout: None,
        }
    }
}

/// A chat node: one listener, any number of sessions.
pub struct PeerNode {
    node_name: Option<String>,
    dial_timeout: Option<Duration>,
    /// Taken by the first dial pass.
    initial_peers: Mutex<Vec<Peer>>,
    registry: ConnectionRegistry,
    bus: Arc<EventBus>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    sessions: tokio::sync::Mutex<JoinSet<()>>,
    _frontend: Subscription,
}

impl PeerNode {
    /// Bind the listener and start accepting connections.
    ///
    /// Also starts relaying `FrontendEvent`s from `bus`. Returns the node and
    /// the accept loop's handle, which completes after [`PeerNode::shutdown`].
    pub async fn start(
        config: PeerConfig,
        bus: Arc<EventBus>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listen = %local_addr,
            name = ?config.node_name,
            peers = config.peers.len(),
            "Peer node listening"
        );

        let registry = ConnectionRegistry::new();
        let (shutdown_tx, _) = watch::channel(false);
        let (frontend, events) = bus.subscribe_channel::<FrontendEvent>();

        tokio::spawn(forward_frontend_events(
            events,
            registry.clone(),
            shutdown_tx.subscribe(),
        ));

        let node = Arc::new(Self {
            node_name: config.node_name,
            dial_timeout: config.dial_timeout,
            initial_peers: Mutex::new(config.peers),
            registry,
            bus,
            local_addr,
            shutdown_tx,
            sessions: tokio::sync::Mutex::new(JoinSet::new()),
            _frontend: frontend,
        });

        let accept_handle = tokio::spawn(Self::accept_loop(listener, Arc::clone(&node)));
        Ok((node, accept_handle))
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Dial one peer and start a session on success.
    ///
    /// Returns once the handshake has been written; the session keeps running
    /// on the node.
    pub async fn connect_to_peer(&self, peer: &Peer) -> Result<ConnectionId, WireError> {
        if self.is_shutting_down() {
            return Err(WireError::ShuttingDown);
        }
        let addr = peer.socket_addr();
        info!(peer = %peer, "Connecting to peer");

        // Nothing has been written yet, so the connect can be dropped.
        let mut shutdown = self.shutdown_tx.subscribe();
        let stream = tokio::select! {
            stream = self.dial(addr) => stream?,
            _ = shutdown_signalled(&mut shutdown) => {
                debug!(peer = %peer, "Dial abandoned for shutdown");
                return Err(WireError::ShuttingDown);
            }
        };

        let session =
            PeerSession::establish_tcp(stream, Direction::Outbound, self.session_context())
                .await?;
        let id = session.connection().id();
        let mut sessions = self.sessions.lock().await;
        reap_finished(&mut sessions);
        sessions.spawn(session.run());
        Ok(id)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, WireError> {
        match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| WireError::DialTimeout(addr))?
                .map_err(WireError::from),
            None => Ok(TcpStream::connect(addr).await?),
        }
    }

    /// Dial every configured peer, one after another.
    ///
    /// A failed dial is logged and the next peer is tried; there is no retry.
    /// The configured list is consumed, so a second call dials nothing.
    /// Returns the number of peers connected.
    pub async fn connect_to_configured_peers(&self) -> usize {
        let peers = std::mem::take(
            &mut *self
                .initial_peers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );

        let mut connected = 0;
        for peer in &peers {
            if self.is_shutting_down() {
                debug!("Dial pass interrupted by shutdown");
                break;
            }
            match self.connect_to_peer(peer).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(peer = %peer, error = %e, "Failed to connect to peer"),
            }
        }
        if !peers.is_empty() {
            info!(connected, attempted = peers.len(), "Initial dial pass complete");
        }
        connected
    }

    /// Handle one frontend event directly, bypassing the bus.
    pub async fn on_frontend_event(&self, event: FrontendEvent) {
        dispatch_frontend_event(&self.registry, event).await;
    }

    /// Stop accepting connections and signal every session to close.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(listen = %self.local_addr, "Peer node shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for every session task to finish, including sessions spawned
    /// while waiting.
    pub async fn wait_sessions(&self) {
        loop {
            // The lock is released before joining so new sessions can spawn.
            let mut sessions = std::mem::take(&mut *self.sessions.lock().await);
            if sessions.is_empty() {
                break;
            }
            while let Some(result) = sessions.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "Session task panicked");
                    }
                }
            }
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            bus: Arc::clone(&self.bus),
            local_name: self.node_name.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Accept loop: establishes an inbound session for each connection.
    async fn accept_loop(listener: TcpListener, node: Arc<Self>) {
        let mut shutdown = node.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "Accepted connection");
                        node.spawn_inbound(stream).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
        info!(listen = %node.local_addr, "Stopped accepting connections");
    }

    async fn spawn_inbound(&self, stream: TcpStream) {
        let ctx = self.session_context();
        let mut sessions = self.sessions.lock().await;
        reap_finished(&mut sessions);
        sessions.spawn(async move {
            match PeerSession::establish_tcp(stream, Direction::Inbound, ctx).await {
                Ok(session) => session.run().await,
                Err(e) => debug!(error = %e, "Inbound handshake failed"),
            }
        });
    }
}

/// Drop the results of sessions that have already ended.
fn reap_finished(sessions: &mut JoinSet<()>) {
    while sessions.try_join_next().is_some() {}
}

/// Apply one frontend event to the node's connections.
pub(crate) async fn dispatch_frontend_event(registry: &ConnectionRegistry, event: FrontendEvent) {
    match event {
        FrontendEvent::SendMessage { message } => {
            match registry.broadcast(&Packet::text_message(message)).await {
                Ok(failures) if !failures.is_empty() => {
                    debug!(failed = failures.len(), "Message not delivered to every peer");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Message not sent"),
            }
        }
        FrontendEvent::Terminate => {
            info!("Terminate requested; shutdown is left to the host");
        }
    }
}

async fn forward_frontend_events(
    mut events: mpsc::UnboundedReceiver<FrontendEvent>,
    registry: ConnectionRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => dispatch_frontend_event(&registry, event).await,
                None => break,
            },
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
    debug!("Frontend relay stopped");
}
