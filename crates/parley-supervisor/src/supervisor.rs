//! Multi-port fan-out.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::{Launcher, ShellLauncher};
use crate::probe::{Prober, TcpProbe};
use crate::watcher::PortWatcher;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Runs one watcher per configured port
pub struct Supervisor<P = TcpProbe, L = ShellLauncher> {
    config: Arc<SupervisorConfig>,
    prober: Arc<P>,
    launcher: Arc<L>,
    running: Arc<watch::Sender<bool>>,
}

/// Cloneable stop handle
#[derive(Clone)]
pub struct SupervisorHandle {
    running: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    /// Clear the running flag; every watcher exits at its next wait
    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    /// Returns true until [`stop`](Self::stop) is called
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

impl Supervisor<TcpProbe, ShellLauncher> {
    /// Supervisor using TCP probes and the platform shell
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidConfig`] if the configuration is rejected.
    pub fn shell(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        Self::new(config, TcpProbe, ShellLauncher)
    }
}

impl<P: Prober, L: Launcher> Supervisor<P, L> {
    /// Create a supervisor with custom probe and launcher capabilities
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidConfig`] if the configuration is rejected.
    pub fn new(config: SupervisorConfig, prober: P, launcher: L) -> Result<Self, SupervisorError> {
        config.validate()?;
        let (running, _) = watch::channel(true);
        Ok(Self {
            config: Arc::new(config),
            prober: Arc::new(prober),
            launcher: Arc::new(launcher),
            running: Arc::new(running),
        })
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Stop handle usable from other tasks
    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Run every watcher in parallel until stopped
    pub async fn run(&self) {
        self.log_banner();

        let mut watchers = JoinSet::new();
        for &port in &self.config.ports {
            let watcher = PortWatcher::new(
                port,
                Arc::clone(&self.config),
                Arc::clone(&self.prober),
                Arc::clone(&self.launcher),
                self.running.subscribe(),
            );
            watchers.spawn(watcher.run());
        }

        while let Some(joined) = watchers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Watcher task failed: {}", e);
            }
        }

        tracing::info!("All watchers stopped");
    }

    fn log_banner(&self) {
        let config = &self.config;
        let cap = if config.max_restarts_per_hour == 0 {
            "unlimited".to_string()
        } else {
            format!("{}/hour", config.max_restarts_per_hour)
        };

        tracing::info!("Supervisor started");
        tracing::info!("  host: {}", config.host);
        tracing::info!("  ports: {:?}", config.ports);
        tracing::info!(
            "  probe every {}s, grace {}s, timeout {}ms, settle {}s",
            config.probe_interval.as_secs(),
            config.restart_grace.as_secs(),
            config.connect_timeout.as_millis(),
            config.settle.as_secs()
        );
        tracing::info!("  restart cap: {}", cap);
        tracing::info!("  command: {}", config.command);
        if let Some(dir) = &config.working_dir {
            tracing::info!("  working dir: {}", dir.display());
        }
    }
}
