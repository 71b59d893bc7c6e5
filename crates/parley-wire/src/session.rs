//! One peer connection from handshake to teardown.
//!
//! A session is created by [`PeerSession::establish`], which registers the
//! connection, announces it on the bus and performs the outgoing handshake
//! (our name, then the addresses of our other peers). [`PeerSession::run`]
//! then reads packets until the peer goes away or the node shuts down.
//!
//! Teardown is tied to the session value itself: however the session ends,
//! including a failed handshake or an aborted task, the connection is removed
//! from the registry and `PeerDisconnected` is published exactly once.

use crate::error::WireError;
use crate::message::{read_packet, write_packet, Packet};
use crate::registry::{BoxedWriter, Connection, ConnectionId, ConnectionRegistry};
use parley_bus::EventBus;
use parley_types::event::BackendEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Reading,
    Closed,
}

/// Node-wide handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: ConnectionRegistry,
    pub bus: Arc<EventBus>,
    /// Name announced in the handshake. `None` skips the `SetName` packet.
    pub local_name: Option<String>,
    /// Flips to `true` when the node shuts down.
    pub shutdown: watch::Receiver<bool>,
}

/// Removes the connection and reports the disconnect, once.
struct Teardown {
    registry: ConnectionRegistry,
    bus: Arc<EventBus>,
    id: ConnectionId,
    remote_addr: SocketAddr,
    done: bool,
}

impl Teardown {
    fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.registry.remove(self.id);
        info!(conn = %self.id, peer = %self.remote_addr, "Disconnected");
        self.bus.send(BackendEvent::PeerDisconnected);
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

/// A live peer connection and its read half.
pub struct PeerSession<R> {
    connection: Arc<Connection>,
    reader: R,
    direction: Direction,
    bus: Arc<EventBus>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    teardown: Teardown,
}

impl PeerSession<OwnedReadHalf> {
    /// Establish a session over an accepted or dialed TCP stream.
    pub async fn establish_tcp(
        stream: TcpStream,
        direction: Direction,
        ctx: SessionContext,
    ) -> Result<Self, WireError> {
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::establish(reader, writer, remote_addr, direction, ctx).await
    }
}

impl<R> PeerSession<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Register the connection, publish `PeerConnected` and send the
    /// handshake.
    ///
    /// The writer stays locked from before registration until the handshake
    /// is written, so a concurrent broadcast can only follow the handshake.
    /// If the handshake write fails the session is torn down before the error
    /// is returned, so `PeerDisconnected` follows the `PeerConnected`.
    pub async fn establish<W>(
        reader: R,
        writer: W,
        remote_addr: SocketAddr,
        direction: Direction,
        ctx: SessionContext,
    ) -> Result<Self, WireError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(remote_addr, writer);
        let mut writer = connection.lock_writer().await;

        ctx.registry.add(&connection);
        let teardown = Teardown {
            registry: ctx.registry.clone(),
            bus: Arc::clone(&ctx.bus),
            id: connection.id(),
            remote_addr,
            done: false,
        };
        info!(
            conn = %connection.id(),
            peer = %remote_addr,
            direction = ?direction,
            "Connected"
        );
        ctx.bus.send(BackendEvent::PeerConnected);

        handshake(&mut writer, connection.id(), &ctx).await?;
        drop(writer);

        Ok(Self {
            connection,
            reader,
            direction,
            bus: ctx.bus.clone(),
            shutdown: ctx.shutdown.clone(),
            state: SessionState::Reading,
            teardown,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read and dispatch packets until the peer disconnects, a frame is
    /// malformed, or the node shuts down. Consumes the session; teardown has
    /// completed when this returns.
    pub async fn run(mut self) {
        let id = self.connection.id();
        loop {
            let next = tokio::select! {
                result = read_packet(&mut self.reader) => Some(result),
                _ = self.connection.aborted() => Some(Err(WireError::ConnectionClosed)),
                _ = shutdown_signalled(&mut self.shutdown) => None,
            };
            match next {
                Some(Ok(packet)) => self.dispatch(packet),
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "Read loop ended");
                    break;
                }
                None => {
                    debug!(conn = %id, "Closing for shutdown");
                    self.connection.close().await;
                    break;
                }
            }
        }
        self.close();
    }

    fn dispatch(&mut self, packet: Packet) {
        let id = self.connection.id();
        match packet {
            Packet::TextMessage { text } => {
                let from = self.connection.display_name();
                debug!(conn = %id, from = %from, len = text.len(), "Message received");
                self.bus.send(BackendEvent::ReceiveMessage {
                    from,
                    message: text,
                });
            }
            Packet::SetName { name } => {
                let previous = self.connection.set_name(name.clone());
                info!(conn = %id, name = %name, previous = ?previous, "Peer named");
                self.bus.send(BackendEvent::SetPeerName { name });
            }
            Packet::PeerDiscovery { ipv4, ipv6 } => {
                debug!(conn = %id, ipv4 = ?ipv4, ipv6 = ?ipv6, "Peer discovery received");
            }
        }
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.teardown.run();
    }
}

/// Write `SetName` (when we have a name) then `PeerDiscovery` listing every
/// other live connection.
async fn handshake(
    writer: &mut BoxedWriter,
    id: ConnectionId,
    ctx: &SessionContext,
) -> Result<(), WireError> {
    if let Some(name) = &ctx.local_name {
        write_packet(writer, &Packet::set_name(name.as_str())).await?;
    }
    let known = ctx.registry.snapshot_addresses_excluding(id);
    debug!(conn = %id, addresses = known.len(), "Sending peer discovery");
    write_packet(writer, &known.into_packet()).await
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is
/// dropped without setting it.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
