//! Live connection registry.
//!
//! The registry maps connection ids to weak handles; sessions own the
//! connections. A connection therefore stays listed only while its session is
//! alive, and removing it here never keeps a dead socket open.

use crate::error::WireError;
use crate::message::{Packet, MAX_DISCOVERY_ADDRESSES};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long [`ConnectionRegistry::broadcast`] waits on one peer's write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// The shared half of a peer connection: identity, announced name and the
/// write side of the socket.
///
/// Writes are serialised by an async mutex so frames from the relay and from
/// the session's own handshake never interleave. A connection whose write was
/// cut off mid-frame is marked broken; later sends fail immediately and the
/// owning session is told to end.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    name: RwLock<Option<String>>,
    writer: Mutex<BoxedWriter>,
    broken: AtomicBool,
    abort: Notify,
}

impl Connection {
    pub fn new<W>(remote_addr: SocketAddr, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: ConnectionId::next(),
            remote_addr,
            name: RwLock::new(None),
            writer: Mutex::new(Box::new(writer)),
            broken: AtomicBool::new(false),
            abort: Notify::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The name the peer announced, if any.
    pub fn name(&self) -> Option<String> {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record the peer's announced name, returning the previous one.
    pub fn set_name(&self, name: impl Into<String>) -> Option<String> {
        let mut slot = self.name.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(name.into())
    }

    /// Announced name, or `address:port` when the peer has not named itself.
    pub fn display_name(&self) -> String {
        self.name()
            .unwrap_or_else(|| self.remote_addr.to_string())
    }

    /// Exclusive access to the writer, for writing several frames back to back.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, BoxedWriter> {
        self.writer.lock().await
    }

    /// Encode and write one packet.
    pub async fn send(&self, packet: &Packet) -> Result<(), WireError> {
        let frame = packet.encode()?;
        self.send_bytes(&frame).await
    }

    /// Write an already-encoded frame.
    pub async fn send_bytes(&self, frame: &[u8]) -> Result<(), WireError> {
        if self.is_broken() {
            return Err(WireError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await.map_err(WireError::closed)?;
        writer.flush().await.map_err(WireError::closed)
    }

    /// Like [`Connection::send_bytes`], but gives up after `limit`. A timed
    /// out write may have left a partial frame behind, so the connection is
    /// aborted.
    pub async fn send_bytes_timeout(&self, frame: &[u8], limit: Duration) -> Result<(), WireError> {
        match tokio::time::timeout(limit, self.send_bytes(frame)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(conn = %self.id, peer = %self.remote_addr, "Write timed out, dropping peer");
                self.abort();
                Err(WireError::WriteTimeout)
            }
        }
    }

    /// Mark the connection unusable and wake its session.
    pub fn abort(&self) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            self.abort.notify_one();
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Resolves once [`Connection::abort`] has been called.
    pub(crate) async fn aborted(&self) {
        self.abort.notified().await
    }

    /// Shut down the write side without waiting for a write in progress.
    ///
    /// If another task holds the writer, the connection is aborted instead and
    /// the socket closes when the last handle is dropped.
    pub async fn close(&self) {
        match self.writer.try_lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(conn = %self.id, error = %e, "Writer shutdown failed");
                }
            }
            Err(_) => {
                debug!(conn = %self.id, "Writer busy, abandoning it");
                self.abort();
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("name", &self.name())
            .finish()
    }
}

/// Remote addresses of the live connections, split by family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSnapshot {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl AddressSnapshot {
    /// Add an address. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn push(&mut self, addr: IpAddr) {
        match addr.to_canonical() {
            IpAddr::V4(v4) => self.ipv4.push(v4),
            IpAddr::V6(v6) => self.ipv6.push(v6),
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    /// Build a `PeerDiscovery` packet, keeping at most 255 addresses per family.
    pub fn into_packet(mut self) -> Packet {
        if self.ipv4.len() > MAX_DISCOVERY_ADDRESSES || self.ipv6.len() > MAX_DISCOVERY_ADDRESSES {
            warn!(
                ipv4 = self.ipv4.len(),
                ipv6 = self.ipv6.len(),
                max = MAX_DISCOVERY_ADDRESSES,
                "Discovery list truncated"
            );
            self.ipv4.truncate(MAX_DISCOVERY_ADDRESSES);
            self.ipv6.truncate(MAX_DISCOVERY_ADDRESSES);
        }
        Packet::peer_discovery(self.ipv4, self.ipv6)
    }
}

/// Registry of live connections, shared by every session of a node.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<BTreeMap<ConnectionId, Weak<Connection>>>>,
    write_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: Arc::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long a broadcast waits on any single peer.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = limit;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Register a connection. Re-adding an id replaces the old entry.
    pub fn add(&self, connection: &Arc<Connection>) {
        let mut map = self.connections.write().unwrap_or_else(|e| e.into_inner());
        map.insert(connection.id(), Arc::downgrade(connection));
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut map = self.connections.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        let map = self.connections.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(&id)
    }

    /// Number of registered connections that are still alive.
    pub fn len(&self) -> usize {
        let map = self.connections.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|conn| conn.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strong handles to every connection that is still alive, in id order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let map = self.connections.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter_map(Weak::upgrade).collect()
    }

    /// Remote addresses of all live connections.
    pub fn snapshot_addresses(&self) -> AddressSnapshot {
        self.collect_addresses(None)
    }

    /// Remote addresses of all live connections except `id`.
    pub fn snapshot_addresses_excluding(&self, id: ConnectionId) -> AddressSnapshot {
        self.collect_addresses(Some(id))
    }

    fn collect_addresses(&self, skip: Option<ConnectionId>) -> AddressSnapshot {
        let mut snapshot = AddressSnapshot::default();
        for conn in self.connections() {
            if Some(conn.id()) != skip {
                snapshot.push(conn.remote_addr().ip());
            }
        }
        snapshot
    }

    /// Send `packet` to every live connection.
    ///
    /// The packet is encoded once and written to all peers concurrently. A
    /// failed write is reported back but does not remove the connection; its
    /// session tears down normally. A peer that does not take the frame within
    /// the write timeout is aborted and reported as
    /// [`WireError::WriteTimeout`], so one stalled peer cannot hold up the
    /// others. Only an encoding failure fails the whole call.
    pub async fn broadcast(
        &self,
        packet: &Packet,
    ) -> Result<Vec<(ConnectionId, WireError)>, WireError> {
        let frame = packet.encode()?;
        let targets = self.connections();
        let frame = &frame;
        let limit = self.write_timeout;
        let results = join_all(targets.iter().map(|conn| async move {
            (conn.id(), conn.send_bytes_timeout(frame, limit).await)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        for (id, e) in &failures {
            debug!(conn = %id, error = %e, "Broadcast write failed");
        }
        debug!(
            packet = ?packet.packet_type(),
            delivered = targets.len() - failures.len(),
            failed = failures.len(),
            "Broadcast"
        );
        Ok(failures)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::read_packet;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use tokio::io::{duplex, DuplexStream};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// A connection whose far end is returned for reading.
    fn linked(remote: &str) -> (Arc<Connection>, DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        (Connection::new(addr(remote), near), far)
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _fa) = linked("10.0.0.1:1");
        let (b, _fb) = linked("10.0.0.1:1");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_add_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _far) = linked("10.0.0.1:2504");
        registry.add(&conn);
        assert!(registry.contains(conn.id()));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(conn.id()));
        assert!(!registry.remove(conn.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_holds_weak_handles() {
        let registry = ConnectionRegistry::new();
        let (conn, _far) = linked("10.0.0.1:2504");
        registry.add(&conn);
        assert_eq!(registry.len(), 1);
        drop(conn);
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
        assert!(registry.connections().is_empty());
        assert!(registry.snapshot_addresses().is_empty());
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let (conn, _far) = linked("192.168.0.9:4000");
        assert_eq!(conn.display_name(), "192.168.0.9:4000");
        assert_eq!(conn.set_name("dave"), None);
        assert_eq!(conn.display_name(), "dave");
        assert_eq!(conn.set_name("david"), Some("dave".to_string()));
    }

    #[test]
    fn test_snapshot_splits_families() {
        let registry = ConnectionRegistry::new();
        let (a, _fa) = linked("10.0.0.2:1");
        let (b, _fb) = linked("[2001:db8::1]:2");
        let (c, _fc) = linked("[::ffff:10.0.0.3]:3");
        for conn in [&a, &b, &c] {
            registry.add(conn);
        }

        let all = registry.snapshot_addresses();
        assert_eq!(
            all.ipv4,
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
        );
        assert_eq!(all.ipv6, vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);

        let others = registry.snapshot_addresses_excluding(a.id());
        assert_eq!(others.len(), 2);
        assert!(!others.ipv4.contains(&Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_oversized_snapshot_truncated() {
        let mut snapshot = AddressSnapshot::default();
        for i in 0..300u32 {
            snapshot.push(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)));
        }
        match snapshot.into_packet() {
            Packet::PeerDiscovery { ipv4, ipv6 } => {
                assert_eq!(ipv4.len(), MAX_DISCOVERY_ADDRESSES);
                assert!(ipv6.is_empty());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let mut fars = Vec::new();
        let mut conns = Vec::new();
        for port in 1..=3 {
            let (conn, far) = linked(&format!("10.0.0.{port}:2504"));
            registry.add(&conn);
            conns.push(conn);
            fars.push(far);
        }

        let failures = registry
            .broadcast(&Packet::text_message("hello all"))
            .await
            .unwrap();
        assert!(failures.is_empty());

        for far in &mut fars {
            assert_eq!(
                read_packet(far).await.unwrap(),
                Packet::text_message("hello all")
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_failure_does_not_remove() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_far) = linked("10.0.0.1:2504");
        let (broken, broken_far) = linked("10.0.0.2:2504");
        let (second, mut second_far) = linked("10.0.0.3:2504");
        drop(broken_far);
        for conn in [&first, &broken, &second] {
            registry.add(conn);
        }

        let failures = registry
            .broadcast(&Packet::text_message("still here?"))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, broken.id());
        assert!(matches!(failures[0].1, WireError::ConnectionClosed));
        assert!(registry.contains(broken.id()));
        assert_eq!(registry.len(), 3);

        for far in [&mut first_far, &mut second_far] {
            assert_eq!(
                read_packet(far).await.unwrap(),
                Packet::text_message("still here?")
            );
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_broadcast() {
        let registry = ConnectionRegistry::new().with_write_timeout(Duration::from_millis(200));
        let (healthy, mut healthy_far) = linked("10.0.0.1:2504");
        // Tiny buffer and a far end nobody reads.
        let (stalled_near, _stalled_far) = duplex(16);
        let stalled = Connection::new(addr("10.0.0.2:2504"), stalled_near);
        registry.add(&healthy);
        registry.add(&stalled);

        let text = "x".repeat(1024);
        let failures = tokio::time::timeout(
            Duration::from_secs(5),
            registry.broadcast(&Packet::text_message(text.clone())),
        )
        .await
        .expect("broadcast stuck behind a stalled peer")
        .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, stalled.id());
        assert!(matches!(failures[0].1, WireError::WriteTimeout));
        assert!(stalled.is_broken());
        assert_eq!(
            read_packet(&mut healthy_far).await.unwrap(),
            Packet::text_message(text)
        );

        // Later broadcasts skip the abandoned peer immediately.
        let failures = tokio::time::timeout(
            Duration::from_secs(1),
            registry.broadcast(&Packet::text_message("next")),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(failures[0].1, WireError::ConnectionClosed));
        assert_eq!(
            read_packet(&mut healthy_far).await.unwrap(),
            Packet::text_message("next")
        );

        tokio::time::timeout(Duration::from_secs(1), stalled.close())
            .await
            .expect("close waited on a stalled writer");
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_busy_writer() {
        let (stalled_near, _stalled_far) = duplex(16);
        let conn = Connection::new(addr("10.0.0.2:2504"), stalled_near);
        let writer = Arc::clone(&conn);
        let stuck = tokio::spawn(async move {
            let _ = writer.send(&Packet::text_message("y".repeat(1024))).await;
        });
        while conn.writer.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .expect("close waited on a busy writer");
        assert!(conn.is_broken());
        stuck.abort();
    }

    #[tokio::test]
    async fn test_broadcast_empty_registry() {
        let registry = ConnectionRegistry::new();
        let failures = registry
            .broadcast(&Packet::text_message("anyone?"))
            .await
            .unwrap();
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (conn, mut far) = linked("10.0.0.1:2504");
        let long = "a".repeat(200 * 1024);
        let short = "b".repeat(10);

        let reader = tokio::spawn(async move {
            let first = read_packet(&mut far).await.unwrap();
            let second = read_packet(&mut far).await.unwrap();
            vec![first, second]
        });

        let c1 = conn.clone();
        let c2 = conn.clone();
        let p1 = Packet::text_message(long.clone());
        let p2 = Packet::text_message(short.clone());
        let (r1, r2) = tokio::join!(c1.send(&p1), c2.send(&p2));
        r1.unwrap();
        r2.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 2);
        assert!(received.contains(&Packet::text_message(long)));
        assert!(received.contains(&Packet::text_message(short)));
    }

    proptest! {
        #[test]
        fn test_snapshot_matches_registered_set(
            ops in proptest::collection::vec((any::<bool>(), 0usize..8), 0..64)
        ) {
            let pool: Vec<_> = (0..8u8)
                .map(|i| Connection::new(SocketAddr::from(([10, 0, 0, i + 1], 2504)), tokio::io::sink()))
                .collect();
            let registry = ConnectionRegistry::new();
            let mut registered = BTreeSet::new();

            for (add, index) in ops {
                let conn = &pool[index];
                if add {
                    registry.add(conn);
                    registered.insert(index);
                } else {
                    prop_assert_eq!(registry.remove(conn.id()), registered.remove(&index));
                }

                let snapshot = registry.snapshot_addresses();
                prop_assert_eq!(snapshot.len(), registered.len());
                prop_assert_eq!(registry.len(), registered.len());
                for i in 0..pool.len() {
                    let listed = snapshot.ipv4.contains(&Ipv4Addr::new(10, 0, 0, i as u8 + 1));
                    prop_assert_eq!(listed, registered.contains(&i));
                }
            }
        }
    }
}
