//! Configuration
//!
//! Settings for both roles of a node. Every field has a default so a partial JSON
//! file (or none at all) is enough; command-line flags are applied on top in `main`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

pub const DEFAULT_TCP_PORT: u16 = 18018;
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Master-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Seconds between two periodic film updates.
    pub polling_interval_secs: u64,
    /// Port used for server names given without one.
    pub default_tcp_port: u16,
    /// Upper bound for establishing a connection to a slave.
    pub connect_timeout_secs: u64,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            default_tcp_port: DEFAULT_TCP_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Slave-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared secret for `ServerReset`.
    pub password: String,
    /// 0 asks the OS for a free port.
    pub tcp_port: u16,
    pub bind_ipv4: Option<Ipv4Addr>,
    pub bind_ipv6: Option<Ipv6Addr>,
    pub thread_count: usize,
    /// Where received files and `.flm` snapshots are written.
    pub work_dir: PathBuf,
    /// Persist `server_resume_<port>.flm` on every film pull.
    pub write_flm: bool,
    pub log_buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            tcp_port: DEFAULT_TCP_PORT,
            bind_ipv4: Some(Ipv4Addr::UNSPECIFIED),
            bind_ipv6: Some(Ipv6Addr::UNSPECIFIED),
            thread_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            work_dir: PathBuf::from("."),
            write_flm: false,
            log_buffer_capacity: crate::logging::DEFAULT_LOG_BUFFER_CAPACITY,
        }
    }
}

impl FarmConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_json(path)
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_json(path)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("unable to read config '{}': {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid config '{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_server_config_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "password": "secret", "tcp_port": 19000 }"#).unwrap();

        assert_eq!(config.password, "secret");
        assert_eq!(config.tcp_port, 19000);
        assert!(!config.write_flm);
        assert_eq!(config.bind_ipv4, Some(Ipv4Addr::UNSPECIFIED));
        assert!(config.thread_count >= 1);
    }

    #[test]
    fn test_farm_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farm.json");
        std::fs::write(&path, r#"{ "polling_interval_secs": 30 }"#).unwrap();

        let config = FarmConfig::load(&path).unwrap();

        assert_eq!(config.polling_interval_secs, 30);
        assert_eq!(config.default_tcp_port, DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let err = ServerConfig::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("unable to read config"));
    }
}
