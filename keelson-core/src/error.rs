//! Error types for the keelson constructor surface.
//!
//! Only setup paths (binding, address parsing, thread spawn) return typed
//! errors. Hot-path I/O failures are handled inline by the reactor: transient
//! errors are retried on the next readiness notification, peer-originated
//! errors surface through the connection callbacks, and contract violations
//! abort the process.

use std::io;
use thiserror::Error;

use crate::addr::AddrError;

/// Main error type for keelson setup operations.
#[derive(Error, Debug)]
pub enum KeelsonError {
    /// IO error during socket setup (bind, listen, option setting).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed address string.
    #[error("address error: {0}")]
    Addr(#[from] AddrError),

    /// A loop thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(io::Error),
}

/// Result type alias for keelson setup operations.
pub type Result<T> = std::result::Result<T, KeelsonError>;

impl KeelsonError {
    /// Check if this error is an address-already-in-use bind failure.
    #[must_use]
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::AddrInUse)
    }
}
