//! Crate-wide error type.
//!
//! Only usage errors and setup failures surface here. Per-connection I/O
//! failures are handled inside the reactor loop and never reach callers.

use std::io;

use thiserror::Error;

use crate::proxy::ProxyState;

/// Errors returned by the reactor and proxy lifecycle APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup or registration failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The reactor is closed or its loop has terminated.
    #[error("reactor is closed")]
    ReactorClosed,
    /// A blocking marshaled call was issued from the reactor thread itself.
    #[error("blocking reactor call issued from the reactor thread")]
    ReactorThread,
    /// Failed to spawn the reactor worker thread.
    #[error("failed to spawn reactor thread: {0}")]
    Spawn(io::Error),
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Lifecycle operation is not legal in the current state.
    #[error("cannot {op} a proxy that is {state}")]
    InvalidState {
        /// Operation that was attempted.
        op: &'static str,
        /// State the proxy was in.
        state: ProxyState,
    },
}

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
