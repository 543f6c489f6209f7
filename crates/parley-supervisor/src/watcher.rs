//! Per-port watcher loop.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::Launcher;
use crate::probe::Prober;
use crate::window::RestartWindow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Result of one probe/restart cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Probe succeeded
    Healthy,
    /// Port down but the hourly cap is reached; no restart launched
    CapExceeded,
    /// Restart launched and the confirming probe succeeded
    Restarted,
    /// Restart launched but the port is still down
    RestartFailed,
    /// Restart command could not be started
    LaunchFailed,
    /// Supervisor stopped mid-cycle
    Stopped,
}

/// Watches one port
pub struct PortWatcher<P, L> {
    port: u16,
    config: Arc<SupervisorConfig>,
    prober: Arc<P>,
    launcher: Arc<L>,
    window: RestartWindow,
    running: watch::Receiver<bool>,
}

impl<P: Prober, L: Launcher> PortWatcher<P, L> {
    /// Create a watcher for `port`; it runs while `running` holds true
    pub fn new(
        port: u16,
        config: Arc<SupervisorConfig>,
        prober: Arc<P>,
        launcher: Arc<L>,
        running: watch::Receiver<bool>,
    ) -> Self {
        let window = RestartWindow::new(config.max_restarts_per_hour);
        Self {
            port,
            config,
            prober,
            launcher,
            window,
            running,
        }
    }

    /// Monitored port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Restart history for this port
    #[must_use]
    pub fn window(&self) -> &RestartWindow {
        &self.window
    }

    /// Probe and cycle until the running flag is cleared
    pub async fn run(mut self) {
        tracing::info!(port = self.port, "Watching port {}", self.port);

        while self.is_running() {
            if self.run_cycle().await == CycleOutcome::Stopped {
                break;
            }
            if !self.pause(self.config.probe_interval).await {
                break;
            }
        }

        tracing::info!(port = self.port, "Watcher for port {} stopped", self.port);
    }

    /// One probe, and a restart if the port is down and the cap allows
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let port = self.port;

        if self.probe().await {
            tracing::info!(port, "[{}] OK", port);
            return CycleOutcome::Healthy;
        }

        if !self.window.permits(Instant::now()) {
            let err = SupervisorError::RestartCapExceeded {
                port,
                cap: self.window.cap(),
            };
            tracing::warn!(port, "{}", err);
            return CycleOutcome::CapExceeded;
        }

        tracing::warn!(
            port,
            "[{}] unreachable, restarting in {}s",
            port,
            self.config.restart_grace.as_secs()
        );
        if !self.pause(self.config.restart_grace).await {
            return CycleOutcome::Stopped;
        }

        let command = self.config.command_for(port);
        if let Err(e) = self
            .launcher
            .launch(&command, port, self.config.working_dir.as_deref())
            .await
        {
            tracing::error!(port, "{}", e);
            return CycleOutcome::LaunchFailed;
        }

        if !self.pause(self.config.settle).await {
            return CycleOutcome::Stopped;
        }

        if self.probe().await {
            self.window.record(Instant::now());
            tracing::info!(
                port,
                "[{}] restarted ({} in the last hour)",
                port,
                self.window.len()
            );
            CycleOutcome::Restarted
        } else {
            tracing::warn!(port, "[{}] restart failed, port still unreachable", port);
            CycleOutcome::RestartFailed
        }
    }

    async fn probe(&self) -> bool {
        self.prober
            .probe(&self.config.host, self.port, self.config.connect_timeout)
            .await
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Sleep unless the running flag clears first; returns false if stopped
    async fn pause(&mut self, delay: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = self.running.wait_for(|running| !*running) => false,
        }
    }
}
