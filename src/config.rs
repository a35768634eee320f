//! Configuration for relays and mounted replicas
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, environment variables (a `.env` file is honoured), and finally
//! command-line flags applied by the binaries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::SyncOptions;
use crate::error::{RelayError, Result, RetryPolicy};
use crate::protocol::codec::DEFAULT_MAX_FRAME_LEN;
use crate::relay::RelayConfig;

pub const DEFAULT_PREFIX: &str = "/vcfs";
pub const DEFAULT_NOTIFY_PORT: u16 = 9001;
pub const DEFAULT_SUBSCRIBE_PORT: u16 = 9000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcfsConfig {
    pub relay: RelaySection,
    pub client: ClientSection,
    pub mount: MountSection,
}

/// Relay listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub bind: IpAddr,
    pub notify_port: u16,
    pub subscribe_port: u16,
    pub notify_read_timeout_ms: u64,
    pub subscriber_write_timeout_ms: u64,
    pub max_frame_len: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            notify_port: DEFAULT_NOTIFY_PORT,
            subscribe_port: DEFAULT_SUBSCRIBE_PORT,
            notify_read_timeout_ms: 5_000,
            subscriber_write_timeout_ms: 2_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Where replicas and hooks find the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Relay subscribe endpoint, `host:port`
    pub relay: String,

    /// Relay notify endpoint, `host:port`
    pub notify: String,

    pub connect_timeout_ms: u64,

    /// Reconnect in the background after the relay link drops
    pub reconnect: bool,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub pull_after_reconnect: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            relay: format!("127.0.0.1:{DEFAULT_SUBSCRIBE_PORT}"),
            notify: format!("127.0.0.1:{DEFAULT_NOTIFY_PORT}"),
            connect_timeout_ms: 3_000,
            reconnect: true,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 30_000,
            pull_after_reconnect: true,
        }
    }
}

/// Backing working tree layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSection {
    /// Root under which each mount point's working tree lives
    pub prefix: PathBuf,
    pub commit_message: String,
}

impl Default for MountSection {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from(DEFAULT_PREFIX),
            commit_message: "automated commit".to_string(),
        }
    }
}

impl VcfsConfig {
    /// Defaults, then `path` (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&text)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Override settings from `VCFS_*` variables looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("VCFS_PREFIX") {
            self.mount.prefix = PathBuf::from(prefix);
        }
        if let Some(relay) = lookup("VCFS_RELAY") {
            self.client.relay = relay;
        }
        if let Some(notify) = lookup("VCFS_NOTIFY") {
            self.client.notify = notify;
        }
        if let Some(port) = lookup("VCFS_NOTIFY_PORT") {
            self.relay.notify_port = parse_port("VCFS_NOTIFY_PORT", &port)?;
        }
        if let Some(port) = lookup("VCFS_SUBSCRIBE_PORT") {
            self.relay.subscribe_port = parse_port("VCFS_SUBSCRIBE_PORT", &port)?;
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            notify_addr: SocketAddr::new(self.relay.bind, self.relay.notify_port),
            subscribe_addr: SocketAddr::new(self.relay.bind, self.relay.subscribe_port),
            notify_read_timeout: Duration::from_millis(self.relay.notify_read_timeout_ms),
            subscriber_write_timeout: Duration::from_millis(self.relay.subscriber_write_timeout_ms),
            max_frame_len: self.relay.max_frame_len,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        let reconnect = self.client.reconnect.then(|| RetryPolicy {
            max_attempts: None,
            initial_delay: Duration::from_millis(self.client.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.client.reconnect_max_ms),
            ..Default::default()
        });

        SyncOptions {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            max_frame_len: self.relay.max_frame_len,
            reconnect,
            pull_after_reconnect: self.client.pull_after_reconnect,
        }
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{key} is not a port: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = VcfsConfig::from_toml(
            r#"
            [relay]
            notify_port = 7001

            [mount]
            prefix = "/srv/replicas"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.notify_port, 7001);
        assert_eq!(config.relay.subscribe_port, DEFAULT_SUBSCRIBE_PORT);
        assert_eq!(config.mount.prefix, PathBuf::from("/srv/replicas"));
        assert_eq!(config.client, ClientSection::default());
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("VCFS_PREFIX", "/data"),
            ("VCFS_RELAY", "relay.internal:9100"),
            ("VCFS_SUBSCRIBE_PORT", "9100"),
        ]
        .into_iter()
        .collect();

        let mut config = VcfsConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mount.prefix, PathBuf::from("/data"));
        assert_eq!(config.client.relay, "relay.internal:9100");
        assert_eq!(config.relay_config().subscribe_addr.port(), 9100);
    }

    #[test]
    fn bad_port_is_a_config_error() {
        let mut config = VcfsConfig::default();
        let err = config
            .apply_env(|key| (key == "VCFS_NOTIFY_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn disabling_reconnect_clears_policy() {
        let mut config = VcfsConfig::default();
        assert!(config.sync_options().reconnect.is_some());

        config.client.reconnect = false;
        assert!(config.sync_options().reconnect.is_none());
    }
}
