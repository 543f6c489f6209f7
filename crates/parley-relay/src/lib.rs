//! # Parley Relay
//!
//! Relay endpoint for the Parley protocol.
//!
//! This crate provides:
//! - A TCP accept loop that spawns one handler task per connection
//! - The name handshake (`INGRESE_NOMBRE` / name reply)
//! - A concurrent name-to-session registry with roster broadcast on every change
//! - Broadcast (`Todos`) and unicast routing of text and files
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley_relay::RelayServer;
//!
//! # async fn run() -> Result<(), parley_relay::RelayError> {
//! let server = RelayServer::bind("0.0.0.0:5000".parse().unwrap()).await?;
//! let handle = server.handle();
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.stop().await;
//! });
//!
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod registry;
pub mod router;
pub mod server;

pub use error::RelayError;
pub use registry::Registry;
pub use router::{Delivery, Router};
pub use server::{RelayHandle, RelayServer, RelayServerConfig};
