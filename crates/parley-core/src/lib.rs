//! # Parley Core
//!
//! Core protocol implementation shared by the Parley peer and relay.
//!
//! This crate provides:
//! - Frame encoding and decoding for both wire generations
//! - Sessions with serialized writes and close-to-unblock semantics
//! - Candidate port lists (explicit lists and contiguous ranges)
//! - Collision-safe storage for received files
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                  │
//! │   (one TCP connection, a display name, one writer at a time)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                   │
//! │   (length-prefixed control/stream frames, legacy colon shim)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod downloads;
pub mod error;
pub mod frame;
pub mod ports;
pub mod session;

pub use downloads::{DownloadStore, sanitize_file_name};
pub use error::{Error, Result};
pub use frame::{Dialect, Frame, FrameReader, encode_frame, read_utf, write_utf};
pub use ports::{PortSpec, PortSpecError, sticky_order};
pub use session::{OUTBOX_FRAMES, Session, SessionReader};

/// Broadcast sentinel: a frame addressed to this name goes to every other session.
pub const BROADCAST: &str = "Todos";

/// Sender name used when the relay operator itself announces text or files.
pub const RELAY_SENDER: &str = "Servidor";

/// Name-request token sent by the relay as the first frame of every session.
pub const NAME_REQUEST: &str = "INGRESE_NOMBRE";

/// Default ceiling for a single stream frame payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Fallback display name derived from a port number.
///
/// Used by the relay when a peer answers the handshake with an empty name,
/// and by the peer when the user supplies none.
#[must_use]
pub fn fallback_name(port: u16) -> String {
    format!("Cliente{port}")
}
