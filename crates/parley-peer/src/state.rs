//! Reconnect state machine.
//!
//! All connection flags live in one [`ReconnectState`] value that the peer
//! keeps behind a single lock, so "is a retry loop running", "did the user
//! hang up" and "which port worked last" are always read and changed
//! together.
//!
//! Every user connect and every manual stop starts a new epoch. Retry loops
//! and listeners carry the epoch they were started in and lose all rights
//! to the connection once it moves on, so a listener left over from before a
//! disconnect can never start a second reconnect loop.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──success──▶ Connected ──▶ Listening
//!      ▲                       │  ▲                                 │
//!      └──exhausted / stop─────┘  └───────────── loss ──────────────┘
//! ```

use parley_core::sticky_order;

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No session and no retry loop
    #[default]
    Disconnected,
    /// A retry loop is running
    Connecting,
    /// Handshake done, listener not yet started
    Connected,
    /// Listener is reading frames
    Listening,
}

/// Candidate ports, sticky preference, attempt counter, and stop flag
#[derive(Debug, Clone)]
pub struct ReconnectState {
    candidates: Vec<u16>,
    sticky: Option<usize>,
    attempts: u32,
    manual_stop: bool,
    reconnecting: bool,
    phase: Phase,
    epoch: u64,
}

impl ReconnectState {
    /// Fresh state over `candidates`
    #[must_use]
    pub fn new(candidates: Vec<u16>) -> Self {
        Self {
            candidates,
            sticky: None,
            attempts: 0,
            manual_stop: false,
            reconnecting: false,
            phase: Phase::Disconnected,
            epoch: 0,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Failed attempts since the last success or user connect
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Index of the last successful candidate
    #[must_use]
    pub fn sticky(&self) -> Option<usize> {
        self.sticky
    }

    /// Candidate ports in configured order
    #[must_use]
    pub fn candidates(&self) -> &[u16] {
        &self.candidates
    }

    /// Returns true once the user asked to disconnect
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.manual_stop
    }

    /// Returns true while an automatic reconnect loop owns the connection
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Current connect epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns true if work started in `epoch` may still touch the connection
    #[must_use]
    pub fn is_current(&self, epoch: u64) -> bool {
        !self.manual_stop && self.epoch == epoch
    }

    /// Candidates for the next attempt: sticky port first, then the rest
    #[must_use]
    pub fn order(&self) -> Vec<(usize, u16)> {
        sticky_order(&self.candidates, self.sticky)
    }

    /// User-initiated connect.
    ///
    /// Returns the new epoch, or `None` if already connecting or connected.
    pub fn begin_connect(&mut self) -> Option<u64> {
        if self.phase != Phase::Disconnected {
            return None;
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.manual_stop = false;
        self.reconnecting = false;
        self.attempts = 0;
        self.phase = Phase::Connecting;
        Some(self.epoch)
    }

    /// Automatic reconnect after loss of a session from `epoch`.
    ///
    /// Returns false if the user stopped, a newer connect took over, or
    /// another reconnect loop is already running.
    pub fn begin_reconnect(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || self.reconnecting {
            return false;
        }
        self.reconnecting = true;
        self.attempts = 0;
        self.phase = Phase::Connecting;
        true
    }

    /// Count a failed pass over the candidates; returns the new total
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Record a successful connect to candidate `index` by a loop from `epoch`.
    ///
    /// Returns false (and changes nothing) if the epoch is over; the caller
    /// must discard the new session.
    pub fn record_success(&mut self, index: usize, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.sticky = Some(index);
        self.attempts = 0;
        self.reconnecting = false;
        self.phase = Phase::Connected;
        true
    }

    /// Listener from `epoch` started on the connected session
    pub fn mark_listening(&mut self, epoch: u64) {
        if self.is_current(epoch) && self.phase == Phase::Connected {
            self.phase = Phase::Listening;
        }
    }

    /// Retry loop ended without success
    pub fn give_up(&mut self) {
        self.reconnecting = false;
        self.phase = Phase::Disconnected;
    }

    /// Manual disconnect; returns the phase before stopping
    pub fn stop(&mut self) -> Phase {
        let previous = self.phase;
        self.epoch = self.epoch.wrapping_add(1);
        self.manual_stop = true;
        self.reconnecting = false;
        self.phase = Phase::Disconnected;
        previous
    }
}
