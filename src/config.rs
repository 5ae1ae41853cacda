use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Service configuration, read from a JSON file.
///
/// The `*_store_config` values are handed to the selected backend's `init`
/// as they are, so their shape depends on the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub port: u16,

    pub image_store_type: String,
    pub image_store_config: serde_json::Value,

    pub metadata_store_type: String,
    pub metadata_store_config: serde_json::Value,

    /// How often the size of running transfers is published.
    pub monitor_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 9001,
            image_store_type: "fs".into(),
            image_store_config: serde_json::Value::Null,
            metadata_store_type: "fjall".into(),
            metadata_store_config: serde_json::Value::Null,
            monitor_interval_secs: 5,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .with_context(|| format!("invalid listen address `{}`", self.address))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn fills_in_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.socket_addr().unwrap(), "0.0.0.0:9001".parse().unwrap());
        assert_eq!(config.image_store_type, "fs");
        assert_eq!(config.metadata_store_type, "fjall");
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
    }

    #[test]
    fn reads_config_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "address": "127.0.0.1",
                "port": 8080,
                "image_store_type": "fs",
                "image_store_config": {{ "dir": "/var/lib/images" }},
                "metadata_store_type": "memory"
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.image_store_config["dir"], "/var/lib/images");
        assert_eq!(config.metadata_store_type, "memory");
        assert!(config.metadata_store_config.is_null());
    }

    #[test]
    fn reports_broken_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse config file"));

        let err = Config::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(err.to_string().starts_with("failed to read config file"));
    }

    #[test]
    fn rejects_invalid_addresses() {
        let config = Config {
            address: "localhost:80".into(),
            ..Default::default()
        };
        assert!(config.socket_addr().is_err());
    }
}
