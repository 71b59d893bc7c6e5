//! Wire protocol packet types and their binary codec.
//!
//! Every frame is a one-byte type tag followed by the type's payload. All
//! multi-byte integers are big-endian.
//!
//! | Tag | Packet          | Payload                                                  |
//! |-----|-----------------|----------------------------------------------------------|
//! | 0   | `TextMessage`   | `u32` length, then that many bytes of text               |
//! | 1   | `SetName`       | `u8` length, then that many bytes of name                |
//! | 2   | `PeerDiscovery` | `u8` IPv4 count, `u8` IPv6 count, 4-byte then 16-byte addresses |

use crate::error::WireError;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Longest text a `TextMessage` length prefix can describe.
pub const MAX_TEXT_LEN: usize = u32::MAX as usize;

/// Longest name a `SetName` length prefix can describe.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Most addresses of one family a `PeerDiscovery` count byte can describe.
pub const MAX_DISCOVERY_ADDRESSES: usize = u8::MAX as usize;

/// Upper bound on buffer space reserved up front for a payload. Larger
/// payloads grow as bytes actually arrive.
const PREALLOC_LIMIT: u64 = 64 * 1024;

/// The one-byte type tag that starts every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    TextMessage = 0,
    SetName = 1,
    PeerDiscovery = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::TextMessage),
            1 => Ok(Self::SetName),
            2 => Ok(Self::PeerDiscovery),
            other => Err(other),
        }
    }
}

/// A single wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A chat line.
    TextMessage { text: String },
    /// The sender's display name.
    SetName { name: String },
    /// Addresses of the sender's other live connections.
    PeerDiscovery {
        ipv4: Vec<Ipv4Addr>,
        ipv6: Vec<Ipv6Addr>,
    },
}

impl Packet {
    pub fn text_message(text: impl Into<String>) -> Self {
        Self::TextMessage { text: text.into() }
    }

    pub fn set_name(name: impl Into<String>) -> Self {
        Self::SetName { name: name.into() }
    }

    pub fn peer_discovery(ipv4: Vec<Ipv4Addr>, ipv6: Vec<Ipv6Addr>) -> Self {
        Self::PeerDiscovery { ipv4, ipv6 }
    }

    /// The frame's type tag.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::TextMessage { .. } => PacketType::TextMessage,
            Self::SetName { .. } => PacketType::SetName,
            Self::PeerDiscovery { .. } => PacketType::PeerDiscovery,
        }
    }

    /// Serialize to a complete frame.
    ///
    /// Fails with [`WireError::FieldTooLong`] when a field does not fit its
    /// length prefix; no bytes are produced in that case.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let tag = self.packet_type() as u8;
        match self {
            Self::TextMessage { text } => {
                let len = prefix::<u32>("text", text.len(), MAX_TEXT_LEN)?;
                let mut bytes = Vec::with_capacity(1 + 4 + text.len());
                bytes.push(tag);
                bytes.extend_from_slice(&len.to_be_bytes());
                bytes.extend_from_slice(text.as_bytes());
                Ok(bytes)
            }
            Self::SetName { name } => {
                let len = prefix::<u8>("name", name.len(), MAX_NAME_LEN)?;
                let mut bytes = Vec::with_capacity(1 + 1 + name.len());
                bytes.push(tag);
                bytes.push(len);
                bytes.extend_from_slice(name.as_bytes());
                Ok(bytes)
            }
            Self::PeerDiscovery { ipv4, ipv6 } => {
                let n4 = prefix::<u8>("ipv4 list", ipv4.len(), MAX_DISCOVERY_ADDRESSES)?;
                let n6 = prefix::<u8>("ipv6 list", ipv6.len(), MAX_DISCOVERY_ADDRESSES)?;
                let mut bytes = Vec::with_capacity(3 + ipv4.len() * 4 + ipv6.len() * 16);
                bytes.push(tag);
                bytes.push(n4);
                bytes.push(n6);
                for addr in ipv4 {
                    bytes.extend_from_slice(&addr.octets());
                }
                for addr in ipv6 {
                    bytes.extend_from_slice(&addr.octets());
                }
                Ok(bytes)
            }
        }
    }
}

fn prefix<T: TryFrom<usize>>(field: &'static str, len: usize, max: usize) -> Result<T, WireError> {
    T::try_from(len).map_err(|_| WireError::FieldTooLong { field, len, max })
}

/// Write one complete frame and flush it.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await.map_err(WireError::closed)?;
    writer.flush().await.map_err(WireError::closed)?;
    Ok(())
}

/// Read one complete frame.
///
/// EOF or an I/O error anywhere in the frame, and an unknown type tag, all
/// fail with [`WireError::ConnectionClosed`]; a partial packet is never
/// returned. Cancelling the returned future mid-frame leaves the stream
/// desynchronised, so it must then be discarded.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await.map_err(WireError::closed)?;
    match PacketType::try_from(tag) {
        Ok(PacketType::TextMessage) => {
            let len = reader.read_u32().await.map_err(WireError::closed)?;
            let text = read_payload(reader, u64::from(len)).await?;
            Ok(Packet::TextMessage {
                text: into_string(text),
            })
        }
        Ok(PacketType::SetName) => {
            let len = reader.read_u8().await.map_err(WireError::closed)?;
            let name = read_payload(reader, u64::from(len)).await?;
            Ok(Packet::SetName {
                name: into_string(name),
            })
        }
        Ok(PacketType::PeerDiscovery) => {
            let n4 = reader.read_u8().await.map_err(WireError::closed)? as usize;
            let n6 = reader.read_u8().await.map_err(WireError::closed)? as usize;

            let mut raw4 = vec![0u8; n4 * 4];
            reader
                .read_exact(&mut raw4)
                .await
                .map_err(WireError::closed)?;
            let mut raw6 = vec![0u8; n6 * 16];
            reader
                .read_exact(&mut raw6)
                .await
                .map_err(WireError::closed)?;

            let ipv4 = raw4
                .chunks_exact(4)
                .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                .collect();
            let ipv6 = raw6
                .chunks_exact(16)
                .map(|c| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(c);
                    Ipv6Addr::from(octets)
                })
                .collect();
            Ok(Packet::PeerDiscovery { ipv4, ipv6 })
        }
        Err(unknown) => {
            warn!(tag = unknown, "Unknown packet type, dropping connection");
            Err(WireError::ConnectionClosed)
        }
    }
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
    let read = (&mut *reader)
        .take(len)
        .read_to_end(&mut buf)
        .await
        .map_err(WireError::closed)?;
    if (read as u64) < len {
        return Err(WireError::ConnectionClosed);
    }
    Ok(buf)
}

fn into_string(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
