//! Configuration system for the Parley CLI.

use parley_core::{DEFAULT_MAX_PAYLOAD, Dialect, PortSpec};
use parley_peer::PeerConfig;
use parley_supervisor::{PORT_PLACEHOLDER, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parley configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Peer configuration
    #[serde(default)]
    pub peer: PeerSection,
    /// Relay configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Relay host
    #[serde(default = "default_host")]
    pub host: String,
    /// Candidate ports (`5000`, `5000,5001`, or `5000-5003`)
    #[serde(default = "default_peer_ports")]
    pub ports: PortSpec,
    /// Display name; asked for at startup when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Passes over the candidates before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds between passes
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Per-candidate connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Use the colon-delimited wire format for outgoing frames
    #[serde(default)]
    pub legacy_framing: bool,
    /// Where received files are written
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// Prefix for received file names
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listening port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted file in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: u64,
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Host the relays listen on
    #[serde(default = "default_host")]
    pub host: String,
    /// First port when supervising a range
    #[serde(default = "default_port")]
    pub base_port: u16,
    /// Explicit ports; overrides `base_port` and `instances`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    /// Number of contiguous instances; asked for at startup when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u16>,
    /// Seconds between probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Seconds to wait before restarting
    #[serde(default = "default_restart_grace")]
    pub restart_grace_secs: u64,
    /// Probe connect timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub connect_timeout_ms: u64,
    /// Seconds to wait after launching before re-probing
    #[serde(default = "default_settle")]
    pub settle_secs: u64,
    /// Successful restarts allowed per port per hour (0 = unlimited)
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_hour: u32,
    /// Restart command; `{port}` is replaced by the monitored port
    #[serde(default = "default_command")]
    pub command: String,
    /// Working directory for the restart command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Log file
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_host() -> String {
    "localhost".to_string()
}

fn default_peer_ports() -> PortSpec {
    PortSpec::single(default_port())
}

fn default_port() -> u16 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    4
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_file_prefix() -> String {
    "recv_".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_max_payload() -> u64 {
    DEFAULT_MAX_PAYLOAD
}

fn default_probe_interval() -> u64 {
    5
}

fn default_restart_grace() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    1500
}

fn default_settle() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    6
}

fn default_command() -> String {
    "parley relay --port {port}".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("supervisor.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_peer_ports(),
            name: None,
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            connect_timeout_secs: default_connect_timeout(),
            legacy_framing: false,
            downloads_dir: default_downloads_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_payload_bytes: default_max_payload(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_port(),
            ports: None,
            instances: None,
            probe_interval_secs: default_probe_interval(),
            restart_grace_secs: default_restart_grace(),
            connect_timeout_ms: default_probe_timeout(),
            settle_secs: default_settle(),
            max_restarts_per_hour: default_max_restarts(),
            command: default_command(),
            working_dir: None,
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("parley/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if bind address and port do not form a socket address.
    pub fn relay_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.relay.bind, self.relay.port);
        addr.parse()
            .map_err(|_| anyhow::anyhow!("Invalid relay bind address: {}", addr))
    }

    /// Peer settings for the peer library
    #[must_use]
    pub fn peer_config(&self) -> PeerConfig {
        let peer = &self.peer;
        PeerConfig {
            host: peer.host.clone(),
            ports: peer.ports.clone(),
            max_attempts: peer.max_attempts,
            retry_delay: Duration::from_secs(peer.retry_delay_secs),
            connect_timeout: Duration::from_secs(peer.connect_timeout_secs),
            dialect: if peer.legacy_framing {
                Dialect::Legacy
            } else {
                Dialect::Framed
            },
            max_payload: self.relay.max_payload_bytes,
        }
    }

    /// Supervisor settings for the given resolved ports
    #[must_use]
    pub fn supervisor_config(&self, ports: Vec<u16>) -> SupervisorConfig {
        let sup = &self.supervisor;
        SupervisorConfig {
            host: sup.host.clone(),
            ports,
            probe_interval: Duration::from_secs(sup.probe_interval_secs),
            restart_grace: Duration::from_secs(sup.restart_grace_secs),
            connect_timeout: Duration::from_millis(sup.connect_timeout_ms),
            settle: Duration::from_secs(sup.settle_secs),
            max_restarts_per_hour: sup.max_restarts_per_hour,
            command: sup.command.clone(),
            working_dir: sup.working_dir.clone(),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay_addr()?;

        if self.relay.port == 0 {
            anyhow::bail!("Relay port must not be 0");
        }
        if self.relay.max_payload_bytes == 0 {
            anyhow::bail!("max_payload_bytes must be positive");
        }

        if self.peer.ports.is_empty() {
            anyhow::bail!("Peer needs at least one candidate port");
        }
        if self.peer.max_attempts == 0 {
            anyhow::bail!("Peer max_attempts must be at least 1");
        }
        if self.peer.host.trim().is_empty() {
            anyhow::bail!("Peer host must not be empty");
        }

        if self.supervisor.base_port == 0 {
            anyhow::bail!("Supervisor base_port must not be 0");
        }
        if let Some(ports) = &self.supervisor.ports {
            if ports.contains(&0) {
                anyhow::bail!("Supervisor ports must not contain 0");
            }
        }
        if self.supervisor.connect_timeout_ms == 0 {
            anyhow::bail!("Supervisor connect_timeout_ms must be positive");
        }
        if !self.supervisor.command.contains(PORT_PLACEHOLDER) {
            anyhow::bail!(
                "Supervisor command '{}' must contain {}",
                self.supervisor.command,
                PORT_PLACEHOLDER
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.peer.host, "localhost");
        assert_eq!(config.peer.ports, PortSpec::single(5000));
        assert_eq!(config.peer.max_attempts, 5);
        assert_eq!(config.relay.port, 5000);
        assert_eq!(config.supervisor.max_restarts_per_hour, 6);
        assert_eq!(config.supervisor.log_file, PathBuf::from("supervisor.log"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.supervisor.command = "parley relay".to_string();
        assert!(config.validate().is_err());

        config.supervisor.command = default_command();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.peer.max_attempts = 0;
        assert!(config.validate().is_err());

        config.peer.max_attempts = 1;
        config.relay.bind = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [peer]
            ports = "5000-5002"
            name = "ana"

            [supervisor]
            instances = 3
            command = "java -jar relay.jar {port}"
            "#,
        )
        .unwrap();

        assert_eq!(config.peer.ports.candidates(), vec![5000, 5001, 5002]);
        assert_eq!(config.peer.name.as_deref(), Some("ana"));
        assert_eq!(config.peer.retry_delay_secs, 3);
        assert_eq!(config.supervisor.instances, Some(3));
        assert_eq!(config.relay.bind, "0.0.0.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_port_spec_rejected() {
        let result: Result<Config, _> = toml::from_str("[peer]\nports = \"5003-5000\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.peer.legacy_framing = true;
        config.supervisor.ports = Some(vec![7000, 7001]);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.peer.legacy_framing);
        assert_eq!(loaded.supervisor.ports, Some(vec![7000, 7001]));
        assert_eq!(loaded.peer_config().dialect, Dialect::Legacy);
    }

    #[test]
    fn test_library_conversions() {
        let config = Config::default();

        let peer = config.peer_config();
        assert_eq!(peer.retry_delay, Duration::from_secs(3));
        assert_eq!(peer.connect_timeout, Duration::from_secs(4));
        assert_eq!(peer.dialect, Dialect::Framed);

        let sup = config.supervisor_config(vec![5000, 5001]);
        assert_eq!(sup.connect_timeout, Duration::from_millis(1500));
        assert_eq!(sup.command_for(5001), "parley relay --port 5001");
        assert!(sup.validate().is_ok());

        assert_eq!(
            config.relay_addr().unwrap(),
            "0.0.0.0:5000".parse::<SocketAddr>().unwrap()
        );
    }
}
