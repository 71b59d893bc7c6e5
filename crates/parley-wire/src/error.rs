//! Errors from the wire protocol layer.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// EOF, an I/O failure, or an unrecognised frame while reading or writing a packet.
    #[error("Connection closed")]
    ConnectionClosed,
    /// A field is longer than its length prefix can describe.
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    /// A write to one peer did not complete in time. The connection is
    /// abandoned, since the peer may have received a partial frame.
    #[error("Write to peer timed out")]
    WriteTimeout,
    /// Dialing a peer did not complete within the configured timeout.
    #[error("Connect to {0} timed out")]
    DialTimeout(SocketAddr),
    /// The node is shutting down and no longer opens connections.
    #[error("Shutdown in progress")]
    ShuttingDown,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Collapse a transport error into [`WireError::ConnectionClosed`].
    pub(crate) fn closed(_: std::io::Error) -> Self {
        Self::ConnectionClosed
    }
}
