//! Supervisor errors.

use std::io;
use thiserror::Error;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Restart command could not be started
    #[error("failed to launch '{command}': {source}")]
    Launch {
        /// Command line after port substitution
        command: String,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Hourly restart cap reached for a port
    #[error("restart cap of {cap}/hour reached for port {port}, skipping restart")]
    RestartCapExceeded {
        /// Monitored port
        port: u16,
        /// Configured hourly cap
        cap: u32,
    },
}
