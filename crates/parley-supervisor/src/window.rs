//! Sliding one-hour restart window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Length of the restart window
pub const RESTART_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Restart timestamps for one port, oldest first
#[derive(Debug, Clone)]
pub struct RestartWindow {
    /// Restarts allowed per window (0 = unlimited)
    cap: u32,
    /// Recorded restarts
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    /// Create an empty window with hourly `cap`
    #[must_use]
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            restarts: VecDeque::new(),
        }
    }

    /// Configured cap
    #[must_use]
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Drop timestamps older than the window
    pub fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) >= RESTART_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Purge, then check whether another restart is allowed
    pub fn permits(&mut self, now: Instant) -> bool {
        self.purge(now);
        self.cap == 0 || self.restarts.len() < self.cap as usize
    }

    /// Record a restart at `now`
    pub fn record(&mut self, now: Instant) {
        self.restarts.push_back(now);
    }

    /// Restarts currently in the window (as of the last purge)
    #[must_use]
    pub fn len(&self) -> usize {
        self.restarts.len()
    }

    /// Returns true if no restarts are recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }
}
