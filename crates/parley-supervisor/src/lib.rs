//! # Parley Supervisor
//!
//! Keeps Parley relay processes alive.
//!
//! One watcher task per monitored port probes the relay with a timed TCP
//! connect. When a port stops answering the watcher waits a grace period,
//! launches the restart command with the port substituted in, lets the new
//! process settle, and probes again. Successful restarts are counted in a
//! sliding one-hour window; once the hourly cap is reached further restarts
//! for that port are skipped until old entries age out.
//!
//! Probing and launching are capabilities ([`Prober`], [`Launcher`]) so the
//! restart policy can be driven by scripted fakes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod supervisor;
pub mod watcher;
pub mod window;

pub use config::{PORT_PLACEHOLDER, SupervisorConfig, resolve_ports};
pub use error::SupervisorError;
pub use launcher::{Launcher, ShellLauncher};
pub use probe::{Prober, TcpProbe};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use watcher::{CycleOutcome, PortWatcher};
pub use window::{RESTART_WINDOW, RestartWindow};
