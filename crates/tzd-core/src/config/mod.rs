//! Daemon configuration.
//!
//! The configuration file is TOML with three sections:
//!
//! ```toml
//! [server]
//! socket_path = "/run/tzd/tzd.sock"
//! socket_mode = 0o660
//! netlink_protocol = 17
//!
//! [device]
//! mcp_timeout_ms = 10000
//! mcp_max_timeouts = 3
//!
//! [registry]
//! path = "/var/lib/tzd/registry"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Values given on the command line override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TzdConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Secure-world device settings.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Trustlet registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl TzdConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the values fail
    /// [`TzdConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("server.command_timeout_ms", self.server.command_timeout_ms),
            ("server.poll_interval_ms", self.server.poll_interval_ms),
            ("server.reap_interval_ms", self.server.reap_interval_ms),
            ("device.mcp_timeout_ms", self.device.mcp_timeout_ms),
            ("device.irq_poll_ms", self.device.irq_poll_ms),
            (
                "device.mcp_max_timeouts",
                u64::from(self.device.mcp_max_timeouts),
            ),
            (
                "device.init_poll_attempts",
                u64::from(self.device.init_poll_attempts),
            ),
            (
                "device.max_queued_notifications",
                self.device.max_queued_notifications as u64,
            ),
            (
                "device.notification_write_timeout_ms",
                self.device.notification_write_timeout_ms,
            ),
            (
                "device.max_unresolved_notifications",
                self.device.max_unresolved_notifications as u64,
            ),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{field} must be non-zero")));
        }
        if self.device.scheduler_interval_ms == Some(0) {
            return Err(ConfigError::Validation(
                "device.scheduler_interval_ms must be non-zero when set".to_string(),
            ));
        }
        if self.server.socket_mode & !0o777 != 0 {
            return Err(ConfigError::Validation(format!(
                "server.socket_mode {:#o} has bits outside 0o777",
                self.server.socket_mode
            )));
        }
        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Path of the stream socket clients connect to.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Permission bits applied to the socket file after bind.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Netlink protocol number of the kernel-side datagram channel.
    ///
    /// Absent disables the netlink listener.
    #[serde(default)]
    pub netlink_protocol: Option<i32>,

    /// Time a client has to deliver a complete command once its header
    /// has arrived.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Interval between liveness checks of datagram peers.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Upper bound on a single readiness wait; bounds how long a listener
    /// takes to notice shutdown.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    /// Command read timeout as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Peer reaping interval as a [`Duration`].
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Readiness wait bound as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            netlink_protocol: None,
            command_timeout_ms: default_command_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Secure-world device configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Identifier clients pass to `OPEN_DEVICE`.
    #[serde(default)]
    pub device_id: DeviceId,

    /// Bound on a single wait for an MCP reply.
    #[serde(default = "default_mcp_timeout_ms")]
    pub mcp_timeout_ms: u64,

    /// Consecutive reply timeouts after which the monitor is declared
    /// faulted even though it still reports itself running.
    #[serde(default = "default_mcp_max_timeouts")]
    pub mcp_max_timeouts: u32,

    /// Bound on a single wait for the secure-side interrupt.
    #[serde(default = "default_irq_poll_ms")]
    pub irq_poll_ms: u64,

    /// Interval at which secure-world time slices are yielded.
    ///
    /// Absent disables the scheduler thread.
    #[serde(default)]
    pub scheduler_interval_ms: Option<u64>,

    /// Normal-world memory donated to the secure world at start-up.
    #[serde(default)]
    pub donate_ram_bytes: u32,

    /// Status polls after `fc_init` before start-up gives up.
    #[serde(default = "default_init_poll_attempts")]
    pub init_poll_attempts: u32,

    /// Notifications held per session while no notification connection
    /// is attached.
    #[serde(default = "default_max_queued_notifications")]
    pub max_queued_notifications: usize,

    /// Notifications held for session ids not yet registered.
    #[serde(default = "default_max_unresolved_notifications")]
    pub max_unresolved_notifications: usize,

    /// Bound on one notification write; a notification connection that
    /// stays blocked longer is dropped.
    #[serde(default = "default_notification_write_timeout_ms")]
    pub notification_write_timeout_ms: u64,
}

impl DeviceConfig {
    /// MCP reply timeout as a [`Duration`].
    #[must_use]
    pub const fn mcp_timeout(&self) -> Duration {
        Duration::from_millis(self.mcp_timeout_ms)
    }

    /// Interrupt wait bound as a [`Duration`].
    #[must_use]
    pub const fn irq_poll(&self) -> Duration {
        Duration::from_millis(self.irq_poll_ms)
    }

    /// Notification write bound as a [`Duration`].
    #[must_use]
    pub const fn notification_write_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_write_timeout_ms)
    }

    /// Scheduler interval, if the scheduler is enabled.
    #[must_use]
    pub fn scheduler_interval(&self) -> Option<Duration> {
        self.scheduler_interval_ms.map(Duration::from_millis)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::default(),
            mcp_timeout_ms: default_mcp_timeout_ms(),
            mcp_max_timeouts: default_mcp_max_timeouts(),
            irq_poll_ms: default_irq_poll_ms(),
            scheduler_interval_ms: None,
            donate_ram_bytes: 0,
            init_poll_attempts: default_init_poll_attempts(),
            max_queued_notifications: default_max_queued_notifications(),
            max_unresolved_notifications: default_max_unresolved_notifications(),
            notification_write_timeout_ms: default_notification_write_timeout_ms(),
        }
    }
}

/// Trustlet registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Directory holding `<uuid>.tlbin` images.
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/tzd/tzd.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_command_timeout_ms() -> u64 {
    5_000
}

const fn default_reap_interval_ms() -> u64 {
    1_000
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_mcp_timeout_ms() -> u64 {
    10_000
}

const fn default_mcp_max_timeouts() -> u32 {
    3
}

const fn default_irq_poll_ms() -> u64 {
    100
}

const fn default_init_poll_attempts() -> u32 {
    50
}

const fn default_max_queued_notifications() -> usize {
    64
}

const fn default_max_unresolved_notifications() -> usize {
    64
}

const fn default_notification_write_timeout_ms() -> u64 {
    1_000
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/tzd/registry")
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TzdConfig::from_toml("").unwrap();
        assert_eq!(config, TzdConfig::default());
        assert_eq!(config.device.mcp_timeout(), Duration::from_secs(10));
        assert_eq!(config.device.mcp_max_timeouts, 3);
        assert!(config.server.netlink_protocol.is_none());
        assert!(config.device.scheduler_interval().is_none());
        assert_eq!(
            config.device.notification_write_timeout(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            socket_path = "/tmp/tzd/tzd.sock"
            socket_mode = 0o600
            netlink_protocol = 17
            command_timeout_ms = 2000

            [device]
            device_id = 4
            mcp_timeout_ms = 500
            mcp_max_timeouts = 5
            scheduler_interval_ms = 20
            donate_ram_bytes = 65536

            [registry]
            path = "/tmp/tzd/registry"
        "#;

        let config = TzdConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/tzd/tzd.sock"));
        assert_eq!(config.server.socket_mode, 0o600);
        assert_eq!(config.server.netlink_protocol, Some(17));
        assert_eq!(config.server.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.device.device_id, DeviceId::new(4));
        assert_eq!(config.device.mcp_timeout(), Duration::from_millis(500));
        assert_eq!(config.device.mcp_max_timeouts, 5);
        assert_eq!(
            config.device.scheduler_interval(),
            Some(Duration::from_millis(20))
        );
        assert_eq!(config.device.donate_ram_bytes, 65536);
        assert_eq!(config.registry.path, PathBuf::from("/tmp/tzd/registry"));
    }

    #[test]
    fn test_rejects_zero_timeout_budget() {
        let err = TzdConfig::from_toml("[device]\nmcp_max_timeouts = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation(ref msg) if msg.contains("mcp_max_timeouts"))
        );
    }

    #[test]
    fn test_rejects_zero_notification_write_timeout() {
        let err =
            TzdConfig::from_toml("[device]\nnotification_write_timeout_ms = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation(ref msg) if msg.contains("notification_write_timeout_ms"))
        );
    }

    #[test]
    fn test_rejects_zero_scheduler_interval() {
        let err = TzdConfig::from_toml("[device]\nscheduler_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_socket_mode() {
        let err = TzdConfig::from_toml("[server]\nsocket_mode = 0o4777\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = TzdConfig::from_toml("[server]\nsocket = \"/tmp/x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = TzdConfig::default();
        config.server.netlink_protocol = Some(17);
        config.device.scheduler_interval_ms = Some(5);
        let text = config.to_toml().unwrap();
        assert_eq!(TzdConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tzd.toml");
        std::fs::write(&path, "[registry]\npath = \"/srv/tl\"\n").unwrap();
        let config = TzdConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.path, PathBuf::from("/srv/tl"));

        let missing = TzdConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
