//! Event types exchanged between the network engine and a frontend.
//!
//! The two families are disjoint: the engine publishes [`BackendEvent`]s and
//! listens for [`FrontendEvent`]s; a frontend does the opposite.

use serde::{Deserialize, Serialize};

/// Events flowing from the network engine to the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// A text message arrived from a connected peer.
    ReceiveMessage {
        /// Peer display name, or `address:port` when the peer has not named itself.
        from: String,
        /// The message text.
        message: String,
    },
    /// A peer announced (or changed) its display name.
    SetPeerName {
        /// The announced name.
        name: String,
    },
    /// A peer connection was established.
    PeerConnected,
    /// A peer connection ended.
    PeerDisconnected,
}

/// Events flowing from the frontend to the network engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontendEvent {
    /// Broadcast a text message to every connected peer.
    SendMessage {
        /// The message text.
        message: String,
    },
    /// The user asked to quit.
    Terminate,
}

impl FrontendEvent {
    /// Shorthand for [`FrontendEvent::SendMessage`].
    pub fn send_message(message: impl Into<String>) -> Self {
        Self::SendMessage {
            message: message.into(),
        }
    }
}
