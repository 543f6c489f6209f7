//! Supervisor configuration.

use crate::error::SupervisorError;
use parley_core::PortSpec;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder replaced by the monitored port in the restart command
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Host the relays listen on
    pub host: String,
    /// Monitored ports, one watcher each
    pub ports: Vec<u16>,
    /// Sleep between probes
    pub probe_interval: Duration,
    /// Wait after a failed probe before restarting
    pub restart_grace: Duration,
    /// Probe connect timeout
    pub connect_timeout: Duration,
    /// Wait after launching before the confirming probe
    pub settle: Duration,
    /// Successful restarts allowed per port per hour (0 = unlimited)
    pub max_restarts_per_hour: u32,
    /// Restart command template containing [`PORT_PLACEHOLDER`]
    pub command: String,
    /// Working directory for the restart command
    pub working_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ports: vec![5000],
            probe_interval: Duration::from_secs(5),
            restart_grace: Duration::from_secs(10),
            connect_timeout: Duration::from_millis(1500),
            settle: Duration::from_secs(5),
            max_restarts_per_hour: 6,
            command: "parley relay --port {port}".to_string(),
            working_dir: None,
        }
    }
}

impl SupervisorConfig {
    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidConfig`] if no ports are given, a
    /// port is 0 or repeated, the host is empty, the probe timeout is zero,
    /// or the command lacks the port placeholder.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.host.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig("host is empty".to_string()));
        }
        if self.ports.is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "no ports to supervise".to_string(),
            ));
        }
        if self.ports.contains(&0) {
            return Err(SupervisorError::InvalidConfig(
                "port 0 cannot be supervised".to_string(),
            ));
        }
        let mut sorted = self.ports.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.ports.len() {
            return Err(SupervisorError::InvalidConfig(
                "ports must be distinct".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "connect timeout must be positive".to_string(),
            ));
        }
        if !self.command.contains(PORT_PLACEHOLDER) {
            return Err(SupervisorError::InvalidConfig(format!(
                "restart command must contain {PORT_PLACEHOLDER}"
            )));
        }
        Ok(())
    }

    /// Restart command for `port`
    #[must_use]
    pub fn command_for(&self, port: u16) -> String {
        self.command.replace(PORT_PLACEHOLDER, &port.to_string())
    }
}

/// Work out which ports to supervise.
///
/// An explicit list wins. Otherwise `instances` contiguous ports from
/// `base_port` are used; when `instances` is absent, `prompt` is asked once.
/// A missing or zero answer means a single instance.
///
/// # Errors
///
/// Returns [`SupervisorError::InvalidConfig`] if the range would run past
/// port 65535.
pub fn resolve_ports(
    base_port: u16,
    explicit: Option<&[u16]>,
    instances: Option<u16>,
    prompt: impl FnOnce() -> Option<u16>,
) -> Result<Vec<u16>, SupervisorError> {
    if let Some(ports) = explicit.filter(|ports| !ports.is_empty()) {
        return Ok(ports.to_vec());
    }

    let count = instances.or_else(prompt).filter(|&n| n > 0).unwrap_or(1);
    let ports = PortSpec::range(base_port, count).candidates();
    if ports.len() != usize::from(count) {
        return Err(SupervisorError::InvalidConfig(format!(
            "{count} instances from port {base_port} run past port 65535"
        )));
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SupervisorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_command_needs_placeholder() {
        let config = SupervisorConfig {
            command: "parley relay".to_string(),
            ..SupervisorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SupervisorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_ports() {
        for ports in [vec![], vec![0], vec![5000, 5000]] {
            let config = SupervisorConfig {
                ports,
                ..SupervisorConfig::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_command_substitution() {
        let config = SupervisorConfig {
            command: "java -jar relay.jar {port} --log relay-{port}.log".to_string(),
            ..SupervisorConfig::default()
        };
        assert_eq!(
            config.command_for(5003),
            "java -jar relay.jar 5003 --log relay-5003.log"
        );
    }

    #[test]
    fn test_resolve_explicit_list_wins() {
        let ports = resolve_ports(5000, Some(&[7000, 7002]), Some(4), || {
            panic!("prompt must not be asked")
        })
        .unwrap();
        assert_eq!(ports, vec![7000, 7002]);
    }

    #[test]
    fn test_resolve_range_from_instances() {
        let ports = resolve_ports(5000, None, Some(3), || None).unwrap();
        assert_eq!(ports, vec![5000, 5001, 5002]);
    }

    #[test]
    fn test_resolve_prompts_once_when_unset() {
        let mut asked = 0;
        let ports = resolve_ports(5000, None, None, || {
            asked += 1;
            Some(2)
        })
        .unwrap();
        assert_eq!(asked, 1);
        assert_eq!(ports, vec![5000, 5001]);

        assert_eq!(resolve_ports(5000, None, None, || None).unwrap(), vec![5000]);
        assert_eq!(resolve_ports(5000, None, None, || Some(0)).unwrap(), vec![5000]);
    }

    #[test]
    fn test_resolve_overflow() {
        assert!(resolve_ports(65535, None, Some(2), || None).is_err());
    }
}
