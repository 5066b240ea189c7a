//! Persisted appliance settings.
//!
//! Saves/loads a small JSON file at `~/.config/netkeeper/config.json` unless a
//! path is given explicitly. The proxy section is whatever the running
//! controller last reported as applied.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NetkeeperError, Result};
use crate::proxy::ProxyConfig;
use crate::system::dhcpcd::DHCPCD_CONF;

/// Every field has a serde default so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// dhcpcd configuration file that static blocks are appended to.
    #[serde(default = "default_dhcpcd_conf")]
    pub dhcpcd_conf: PathBuf,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_dhcpcd_conf() -> PathBuf {
    PathBuf::from(DHCPCD_CONF)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dhcpcd_conf: default_dhcpcd_conf(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Default config file path: `~/.config/netkeeper/config.json`.
    ///
    /// Returns `None` if the config directory can't be determined.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("netkeeper").join("config.json"))
    }

    /// Load from the default path, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::path().map_or_else(Self::default, |path| Self::load_or_default(&path))
    }

    fn load_or_default(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!("ignoring config: {}", e);
            Self::default()
        })
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is
    /// an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(NetkeeperError::io(path, e)),
        };

        serde_json::from_str(&contents).map_err(|source| NetkeeperError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NetkeeperError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| {
            NetkeeperError::ConfigParse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        fs::write(path, json).map_err(|e| NetkeeperError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"proxy": {}}"#).unwrap();
        assert_eq!(config.dhcpcd_conf, PathBuf::from("/etc/dhcpcd.conf"));
        assert_eq!(config.proxy.listen_address, "127.0.0.1:8081");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.proxy.listen_address = "192.168.1.2:3128".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.proxy.listen_address, "192.168.1.2:3128");
    }

    #[test]
    fn test_best_effort_load_ignores_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();

        let config = Config::load_or_default(&bad);
        assert_eq!(config.proxy.listen_address, "127.0.0.1:8081");
        assert_eq!(config.dhcpcd_conf, PathBuf::from(DHCPCD_CONF));
    }

    #[test]
    fn test_load_from_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();

        let missing = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing.proxy.listen_address, "127.0.0.1:8081");

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            Config::load_from(&bad),
            Err(NetkeeperError::ConfigParse { .. })
        ));
    }
}
