//! parley wire protocol: peer-to-peer chat networking.
//!
//! Every node listens for inbound TCP connections and dials a configured set
//! of peers. Each connection exchanges binary-framed packets and reports what
//! it sees on the [`parley_bus::EventBus`].
//!
//! ## Architecture
//!
//! - **Packet**: binary wire messages and their codec
//! - **ConnectionRegistry**: live connections, used for broadcast and peer discovery
//! - **PeerSession**: one connection's handshake, read loop and teardown
//! - **PeerNode**: accepts and dials connections, owns the sessions, relays outgoing messages

pub mod error;
pub mod message;
pub mod peer;
pub mod registry;
pub mod session;

pub use error::WireError;
pub use message::{read_packet, write_packet, Packet, PacketType};
pub use peer::{PeerConfig, PeerNode};
pub use registry::{AddressSnapshot, Connection, ConnectionId, ConnectionRegistry};
pub use session::{Direction, PeerSession, SessionContext, SessionState};
