//! Kernel of a parley chat node.
//!
//! Loads the node's configuration, creates the event bus and the peer node,
//! runs the initial dial pass and shuts everything down in order.

pub mod config;
pub mod error;
pub mod kernel;

pub use error::{KernelError, KernelResult};
pub use kernel::ChatKernel;
