//! # Parley Peer
//!
//! Connecting side of the Parley protocol.
//!
//! This crate provides:
//! - A [`Dialer`] capability with a timed TCP implementation
//! - The reconnect state machine (sticky port first, fixed delay, bounded attempts)
//! - A [`Peer`] handle that sends text and files and streams [`PeerEvent`]s
//!   (status lines, roster, messages, received files) to the UI
//! - A process-lifetime display name cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley_core::DownloadStore;
//! use parley_peer::{FixedName, Peer, PeerConfig, PeerEvent};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), parley_peer::PeerError> {
//! let (peer, mut events) = Peer::tcp(
//!     PeerConfig::default(),
//!     Arc::new(FixedName::new("ana")),
//!     DownloadStore::new("downloads", "recv_"),
//! )?;
//!
//! peer.connect().await?;
//! peer.send_text("hola").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let PeerEvent::Status(line) = event {
//!         println!("{line}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dialer;
pub mod error;
pub mod name;
pub mod peer;
pub mod state;

pub use dialer::{Connection, Dialer, TcpDialer};
pub use error::PeerError;
pub use name::{FixedName, NameCache, NameSource};
pub use peer::{Peer, PeerConfig, PeerEvent, visible_roster};
pub use state::{Phase, ReconnectState};
