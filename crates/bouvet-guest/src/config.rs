//! Agent configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! match the paths a stock guest kernel exposes.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known vsock port the host dials.
pub const DEFAULT_VSOCK_PORT: u32 = 1024;

/// Name the hypervisor gives the agent's virtio-serial port.
pub const DEFAULT_SERIAL_CHANNEL_NAME: &str = "agent.channel.0";

/// Default log directives used when `BOUVET_AGENT_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "bouvet_agent=info,bouvet_guest=info";

/// Kernel-exposed paths the agent probes.
///
/// Every root is overridable so tests can build fake sysfs trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPaths {
    /// Virtio-serial port directory (one subdirectory per port).
    pub virtio_ports: PathBuf,
    /// Device node root.
    pub dev_root: PathBuf,
    /// Device node whose presence means the hypervisor wired up vsock.
    pub vsock_device: PathBuf,
    /// PCI device directory.
    pub pci_devices: PathBuf,
    /// SCSI host directory (`hostN/scan`).
    pub scsi_host: PathBuf,
    /// SCSI disk directory (`0:0:<id>:<lun>/device/block`).
    pub scsi_disk: PathBuf,
    /// Resolver configuration rewritten on DNS updates.
    pub resolv_conf: PathBuf,
}

impl Default for GuestPaths {
    fn default() -> Self {
        Self::with_sysfs_root("/sys")
    }
}

impl GuestPaths {
    /// Paths with every sysfs entry rooted at `sysfs` instead of `/sys`.
    pub fn with_sysfs_root(sysfs: impl AsRef<Path>) -> Self {
        let sysfs = sysfs.as_ref();
        Self {
            virtio_ports: sysfs.join("class/virtio-ports"),
            dev_root: PathBuf::from("/dev"),
            vsock_device: PathBuf::from("/dev/vsock"),
            pci_devices: sysfs.join("bus/pci/devices"),
            scsi_host: sysfs.join("class/scsi_host"),
            scsi_disk: sysfs.join("class/scsi_disk"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

/// Configuration for the guest agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// vsock port to listen on.
    pub vsock_port: u32,
    /// Substring matched against virtio-serial port names.
    pub serial_channel_name: String,
    /// How long device handlers wait for a hotplugged node.
    pub hotplug_timeout: Duration,
    /// Delay between hotplug probes.
    pub hotplug_poll_interval: Duration,
    /// `tracing` filter directives.
    pub log_filter: String,
    /// Kernel paths.
    pub paths: GuestPaths,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("vsock port must be > 0")]
    InvalidVsockPort,

    #[error("serial channel name must not be empty")]
    EmptySerialName,

    #[error("hotplug timeout and poll interval must be > 0")]
    InvalidHotplugTiming,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            vsock_port: DEFAULT_VSOCK_PORT,
            serial_channel_name: DEFAULT_SERIAL_CHANNEL_NAME.to_string(),
            hotplug_timeout: Duration::from_secs(3),
            hotplug_poll_interval: Duration::from_millis(50),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            paths: GuestPaths::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BOUVET_AGENT_VSOCK_PORT` | `1024` |
    /// | `BOUVET_AGENT_SERIAL_NAME` | `agent.channel.0` |
    /// | `BOUVET_AGENT_HOTPLUG_TIMEOUT_SECS` | `3` |
    /// | `BOUVET_AGENT_HOTPLUG_POLL_MS` | `50` |
    /// | `BOUVET_AGENT_LOG` | `bouvet_agent=info,bouvet_guest=info` |
    /// | `BOUVET_AGENT_SYSFS_ROOT` | `/sys` |
    /// | `BOUVET_AGENT_RESOLV_CONF` | `/etc/resolv.conf` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let mut paths = std::env::var("BOUVET_AGENT_SYSFS_ROOT")
            .map(GuestPaths::with_sysfs_root)
            .unwrap_or(default.paths);
        if let Ok(resolv) = std::env::var("BOUVET_AGENT_RESOLV_CONF") {
            paths.resolv_conf = PathBuf::from(resolv);
        }

        Self {
            vsock_port: std::env::var("BOUVET_AGENT_VSOCK_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.vsock_port),
            serial_channel_name: std::env::var("BOUVET_AGENT_SERIAL_NAME")
                .unwrap_or(default.serial_channel_name),
            hotplug_timeout: std::env::var("BOUVET_AGENT_HOTPLUG_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.hotplug_timeout),
            hotplug_poll_interval: std::env::var("BOUVET_AGENT_HOTPLUG_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.hotplug_poll_interval),
            log_filter: std::env::var("BOUVET_AGENT_LOG").unwrap_or(default.log_filter),
            paths,
        }
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vsock_port == 0 {
            return Err(ConfigError::InvalidVsockPort);
        }
        if self.serial_channel_name.is_empty() {
            return Err(ConfigError::EmptySerialName);
        }
        if self.hotplug_timeout.is_zero() || self.hotplug_poll_interval.is_zero() {
            return Err(ConfigError::InvalidHotplugTiming);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.vsock_port, 1024);
        assert_eq!(config.serial_channel_name, "agent.channel.0");
        assert_eq!(config.hotplug_timeout, Duration::from_secs(3));
        assert_eq!(
            config.paths.virtio_ports,
            PathBuf::from("/sys/class/virtio-ports")
        );
        assert_eq!(
            config.paths.pci_devices,
            PathBuf::from("/sys/bus/pci/devices")
        );
        assert_eq!(config.paths.scsi_host, PathBuf::from("/sys/class/scsi_host"));
        assert_eq!(config.paths.vsock_device, PathBuf::from("/dev/vsock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sysfs_root_override() {
        let paths = GuestPaths::with_sysfs_root("/tmp/fake-sys");
        assert_eq!(
            paths.scsi_disk,
            PathBuf::from("/tmp/fake-sys/class/scsi_disk")
        );
        assert_eq!(paths.dev_root, PathBuf::from("/dev"));
    }

    #[test]
    fn test_validation() {
        let config = AgentConfig {
            vsock_port: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVsockPort)
        ));

        let config = AgentConfig {
            serial_channel_name: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptySerialName)));

        let config = AgentConfig {
            hotplug_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHotplugTiming)
        ));
    }
}
