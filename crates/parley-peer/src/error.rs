//! Peer errors.

use std::io;
use thiserror::Error;

/// Peer errors
#[derive(Debug, Error)]
pub enum PeerError {
    /// Every attempt failed; the user must re-initiate
    #[error("could not connect after {attempts} attempts")]
    Exhausted {
        /// Attempts made
        attempts: u32,
    },

    /// No live session to send on
    #[error("not connected")]
    NotConnected,

    /// Manual disconnect interrupted the retry loop
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// File to send could not be read
    #[error("could not read {path}: {source}")]
    ReadFile {
        /// Path that was requested
        path: String,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Protocol-level failure
    #[error(transparent)]
    Core(#[from] parley_core::Error),
}
