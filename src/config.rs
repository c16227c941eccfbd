//! Daemon configuration loaded from a fixed search path
//!
//! Handles:
//! - Broker address and credentials
//! - Device display name (hostname when unset)
//! - Named health checks and their device classes
//! - Poll interval and per-command timeout

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub mqtt_broker: String,
    #[serde(default = "default_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckConfig>,
}

/// One named health check. A check with no command is always considered alive.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

/// Directories probed for `config.toml` and the persisted device identity,
/// in order: system locations first, then the user config dir.
pub fn search_dirs() -> Vec<PathBuf> {
    let mut dirs_list = vec![
        PathBuf::from("/etc/mqtt-alive-agent"),
        PathBuf::from("/usr/local/etc/mqtt-alive-agent"),
    ];
    if let Some(base) = dirs::config_dir() {
        dirs_list.push(base.join("mqtt-alive-agent"));
    }
    dirs_list
}

impl DaemonConfig {
    /// Load configuration from the standard search path.
    pub async fn load() -> Result<Self> {
        Self::load_from(&search_dirs()).await
    }

    /// Load configuration from the first readable `config.toml` in `dirs`.
    pub async fn load_from(dirs: &[PathBuf]) -> Result<Self> {
        for dir in dirs {
            let path = dir.join(CONFIG_FILE);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            debug!("loading configuration from {}", path.display());
            let config: DaemonConfig = toml::from_str(&content)
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }

        let searched: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
        bail!(
            "no readable {} in any of: {}",
            CONFIG_FILE,
            searched.join(", ")
        )
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt_broker.trim().is_empty() {
            bail!("mqtt_broker must not be empty");
        }
        if self.interval_secs == 0 {
            bail!("interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Broker host and port. The address may carry its own `host:port`;
    /// the `mqtt_port` field applies only when it does not.
    pub fn broker_addr(&self) -> (String, u16) {
        let addr = self
            .mqtt_broker
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");
        match addr.rsplit_once(':') {
            // A second colon in the host part means a bare IPv6 address.
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (addr.to_string(), self.mqtt_port),
            },
            _ => (addr.to_string(), self.mqtt_port),
        }
    }

    /// Display name for the device descriptor, defaulting to the hostname.
    pub fn device_display_name(&self) -> String {
        match &self.device_name {
            Some(name) => name.clone(),
            None => gethostname::gethostname().to_string_lossy().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, content: &str) {
        std::fs::write(dir.join(CONFIG_FILE), content).unwrap();
    }

    #[tokio::test]
    async fn test_load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "mqtt_broker = \"broker.lan\"\n");

        let config = DaemonConfig::load_from(&[dir.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(config.mqtt_broker, "broker.lan");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.interval_secs, 60);
        assert!(config.checks.is_empty());
    }

    #[tokio::test]
    async fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
mqtt_broker = "tcp://broker.lan:8883"
mqtt_username = "ha"
mqtt_password = "secret"
device_name = "office-pi"
interval_secs = 5

[checks.disk]
command = "df -x tmpfs / > /dev/null"
device_class = "problem"

[checks.vpn]
command = "ping -c1 10.0.0.1"
"#,
        );

        let config = DaemonConfig::load_from(&[dir.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(config.broker_addr(), ("broker.lan".to_string(), 8883));
        assert_eq!(config.device_display_name(), "office-pi");
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.checks.len(), 2);
        assert!(config.checks["vpn"].device_class.is_none());
    }

    #[tokio::test]
    async fn test_first_readable_dir_wins() {
        let missing = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_config(system.path(), "mqtt_broker = \"system.lan\"\n");
        write_config(user.path(), "mqtt_broker = \"user.lan\"\n");

        let dirs = vec![
            missing.path().join("absent"),
            system.path().to_path_buf(),
            user.path().to_path_buf(),
        ];
        let config = DaemonConfig::load_from(&dirs).await.unwrap();
        assert_eq!(config.mqtt_broker, "system.lan");
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load_from(&[dir.path().to_path_buf()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "mqtt_broker = \"broker.lan\"\ninterval_secs = 0\n");

        let result = DaemonConfig::load_from(&[dir.path().to_path_buf()]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_broker_addr_without_port() {
        let config = DaemonConfig {
            mqtt_broker: "broker.lan".to_string(),
            mqtt_port: 1884,
            mqtt_username: None,
            mqtt_password: None,
            device_name: None,
            interval_secs: 60,
            command_timeout_secs: 30,
            checks: BTreeMap::new(),
        };
        assert_eq!(config.broker_addr(), ("broker.lan".to_string(), 1884));
    }
}
