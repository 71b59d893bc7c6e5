//! Event bus for the parley chat node.
//!
//! A synchronous, in-process publish/subscribe register. Publishing an event
//! calls every handler registered for that event's family, in place, on the
//! publishing thread. There is no queueing in the bus itself; consumers that
//! need to hop onto an async task use [`EventBus::subscribe_channel`].
//!
//! ```text
//!   frontend ──FrontendEvent──▶ ┌──────────┐ ──FrontendEvent──▶ PeerNode
//!                              │ EventBus │
//!   frontend ◀──BackendEvent── └──────────┘ ◀──BackendEvent─── PeerSession
//! ```

pub mod bus;

pub use bus::{BusEvent, EventBus, HandlerId, HandlerTable, Subscription};
