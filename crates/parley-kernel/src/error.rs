//! Kernel-specific error types.

use parley_wire::WireError;
use thiserror::Error;

/// Kernel error type.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped wire protocol error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
