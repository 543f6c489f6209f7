//! Error types for the Parley core protocol.

use std::io;
use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying stream I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Could not establish a TCP connection (timeout, refused, unknown host)
    #[error("could not connect to {addr}: {source}")]
    ConnectFailure {
        /// Address that was dialed
        addr: String,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Stream frame ended before its declared length was consumed
    #[error("transfer truncated: expected {expected} bytes, received {received}")]
    TruncatedTransfer {
        /// Declared payload length
        expected: u64,
        /// Bytes actually read before the stream ended
        received: u64,
    },

    /// Unexpected token or malformed frame
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// String does not fit the u16 length prefix
    #[error("string too long for wire encoding: {0} bytes")]
    StringTooLong(usize),

    /// Stream frame declares more bytes than the configured ceiling
    #[error("payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Declared payload length
        declared: u64,
        /// Configured ceiling
        limit: u64,
    },

    /// Session has been closed locally
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Returns true if this error means the underlying connection is gone.
    ///
    /// A truncated transfer always counts: truncation is only ever observed
    /// as end-of-stream on a TCP connection.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectFailure { .. } | Error::SessionClosed => true,
            Error::TruncatedTransfer { .. } => true,
            Error::ProtocolViolation(_)
            | Error::StringTooLong(_)
            | Error::PayloadTooLarge { .. } => false,
        }
    }

    /// Create a protocol violation error from any displayable context.
    pub fn violation(context: impl Into<String>) -> Self {
        Error::ProtocolViolation(context.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TruncatedTransfer {
            expected: 10,
            received: 4,
        };
        assert_eq!(
            err.to_string(),
            "transfer truncated: expected 10 bytes, received 4"
        );

        let err = Error::violation("unknown token: PING");
        assert_eq!(err.to_string(), "protocol violation: unknown token: PING");
    }

    #[test]
    fn test_connection_classification() {
        let io = Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(io.is_connection_error());
        assert!(Error::SessionClosed.is_connection_error());
        assert!(!Error::violation("bad").is_connection_error());
        assert!(!Error::StringTooLong(70_000).is_connection_error());
    }
}
