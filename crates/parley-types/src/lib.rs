//! Core types for the parley peer-to-peer chat node.
//!
//! This crate defines the data structures shared between the event bus, the
//! wire engine, the kernel and any frontend. It contains no business logic.

pub mod config;
pub mod event;
pub mod peer;

pub use config::{ChatConfig, PeerSpec, DEFAULT_NAME, DEFAULT_PORT};
pub use event::{BackendEvent, FrontendEvent};
pub use peer::{Peer, PeerParseError};
