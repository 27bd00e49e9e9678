//! Daemon configuration (`daemon.yaml`).
//!
//! The config is written once at bootstrap/join time and read back on every
//! restart. It intentionally holds only what cannot be derived from the
//! replicated store: this node's identity, its listen address, and the map of
//! additional named listeners.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::state_dir::StateDir;

/// Default heartbeat interval between leader rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for one additional named TLS listener.
///
/// Additional listeners serve only extended endpoints and share the cluster
/// certificate; their keypairs are issued at bootstrap and transported to
/// joiners inside the token-exchange response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// host:port the listener binds.
    pub address: String,
}

/// On-disk daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Member name — the node's identity across the cluster.
    pub name: String,

    /// host:port of the cluster TLS listener.
    pub address: String,

    /// Additional named listeners.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Interval between leader heartbeat rounds, e.g. `"10s"` or `"1m"`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

impl DaemonConfig {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            servers: BTreeMap::new(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }

    /// Load the config from `<state_dir>/daemon.yaml`.
    pub fn load(dir: &StateDir) -> Result<Self> {
        let raw = std::fs::read_to_string(dir.daemon_config())?;
        let config: DaemonConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the config atomically.
    pub fn save(&self, dir: &StateDir) -> Result<()> {
        self.validate()?;
        let yaml = serde_yaml::to_string(self)?;
        StateDir::write_atomic(&dir.daemon_config(), yaml.as_bytes())
    }

    pub fn exists(dir: &StateDir) -> bool {
        dir.daemon_config().is_file()
    }

    /// The parsed heartbeat interval.
    pub fn interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Conflict("member name cannot be empty".into()));
        }
        if self.name.contains('/') || self.name.contains("..") {
            return Err(Error::Conflict(format!(
                "member name {:?} is not a valid file name",
                self.name
            )));
        }
        validate_address(&self.address)?;
        for (name, server) in &self.servers {
            if name == "core" {
                return Err(Error::Conflict("listener name \"core\" is reserved".into()));
            }
            validate_address(&server.address)?;
        }
        parse_duration(&self.heartbeat_interval)?;
        Ok(())
    }
}

/// Check `addr` parses as host:port with a non-zero port.
pub fn validate_address(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Conflict(format!("address {:?} is not host:port", addr)))?;
    if host.is_empty() {
        return Err(Error::Conflict(format!("address {:?} has an empty host", addr)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Conflict(format!("address {:?} has an invalid port", addr)))?;
    if port == 0 {
        return Err(Error::Conflict(format!("address {:?} has port zero", addr)));
    }
    Ok(())
}

/// Parse a short duration string: `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Conflict("duration string cannot be empty".into()));
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| Error::Conflict(format!("invalid duration {:?}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(Error::Conflict(format!(
            "unknown duration unit {:?} in {:?}",
            unit, s
        ))),
    }
}

/// Load config if present, used by restart paths that must distinguish a
/// fresh node from an initialized one.
pub fn load_if_initialized(dir: &StateDir) -> Result<Option<DaemonConfig>> {
    if DaemonConfig::exists(dir) {
        DaemonConfig::load(dir).map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_through_yaml() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();

        let mut config = DaemonConfig::new("member1", "127.0.0.1:9001");
        config.servers.insert(
            "metrics".into(),
            ServerConfig {
                address: "127.0.0.1:9101".into(),
            },
        );
        config.save(&dir).unwrap();

        let loaded = DaemonConfig::load(&dir).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.interval(), Duration::from_secs(10));
    }

    #[test]
    fn missing_config_is_uninitialized() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        assert!(load_if_initialized(&dir).unwrap().is_none());
    }

    #[test]
    fn rejects_empty_name() {
        let config = DaemonConfig::new("", "127.0.0.1:9001");
        assert!(matches!(config.validate(), Err(Error::Conflict(_))));
    }

    #[test]
    fn rejects_path_traversal_name() {
        let config = DaemonConfig::new("../evil", "127.0.0.1:9001");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(validate_address("127.0.0.1").is_err());
        assert!(validate_address(":9001").is_err());
        assert!(validate_address("127.0.0.1:0").is_err());
        assert!(validate_address("127.0.0.1:notaport").is_err());
        assert!(validate_address("127.0.0.1:9001").is_ok());
        assert!(validate_address("[::1]:9001").is_ok());
    }

    #[test]
    fn rejects_reserved_listener_name() {
        let mut config = DaemonConfig::new("m1", "127.0.0.1:9001");
        config.servers.insert(
            "core".into(),
            ServerConfig {
                address: "127.0.0.1:9002".into(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
