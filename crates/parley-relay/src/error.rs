//! Relay errors.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listening port could not be bound (usually already in use)
    #[error("could not bind relay to {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: SocketAddr,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// File to announce could not be read
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = RelayError::Bind {
            addr: "127.0.0.1:5000".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("could not bind relay to 127.0.0.1:5000"));
    }
}
