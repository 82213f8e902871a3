//! Configuration file handling
//!
//! Settings load from an optional `xdebug-bridge.toml` in the project
//! root, then recognized environment variables override individual keys.

use serde::Deserialize;
use std::path::PathBuf;

use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base TCP port the bridge listens on for the debuggee
    #[serde(default = "default_port")]
    pub port: u16,

    /// Inclusive upper bound for the bind retry walk
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Seconds to wait for the debuggee to dial in, and per-command timeout
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Idle milliseconds before an unattended session is terminated
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_ms: u64,

    /// Hard upper bound for variable inspection depth
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Children returned per compound value when unspecified
    #[serde(default = "default_max_children")]
    pub default_max_children: u32,

    /// Ledger and summary location
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Base for local path normalization
    #[serde(default)]
    pub project_root: Option<PathBuf>,

    /// Explicit path mappings, local prefix to remote prefix
    #[serde(default)]
    pub path_mappings: Vec<PathMappingEntry>,

    /// Verbose diagnostic logging
    #[serde(default)]
    pub debug: bool,
}

/// One explicit path mapping from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct PathMappingEntry {
    pub local: String,
    pub remote: String,
}

fn default_port() -> u16 {
    9003
}
fn default_port_range_end() -> u16 {
    9010
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_watchdog_timeout() -> u64 {
    300_000
}
fn default_max_depth() -> u32 {
    3
}
fn default_max_children() -> u32 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            port_range_end: default_port_range_end(),
            connection_timeout_secs: default_connection_timeout(),
            watchdog_timeout_ms: default_watchdog_timeout(),
            max_depth: default_max_depth(),
            default_max_children: default_max_children(),
            data_dir: None,
            project_root: None,
            path_mappings: Vec::new(),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from `xdebug-bridge.toml` in the project root,
    /// falling back to defaults, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn load_file() -> Result<Self> {
        let path = PathBuf::from("xdebug-bridge.toml");
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return toml::from_str(&content).map_err(|e| Error::Config(e.to_string()));
        }
        Ok(Self::default())
    }

    /// Recognized environment variables, one per config key
    fn apply_env(&mut self) {
        if let Some(v) = env_parse("XDEBUG_BRIDGE_PORT") {
            self.port = v;
        }
        if let Some(v) = env_parse("XDEBUG_BRIDGE_PORT_RANGE_END") {
            self.port_range_end = v;
        }
        if let Some(v) = env_parse("XDEBUG_BRIDGE_CONNECTION_TIMEOUT") {
            self.connection_timeout_secs = v;
        }
        if let Some(v) = env_parse("XDEBUG_BRIDGE_WATCHDOG_TIMEOUT") {
            self.watchdog_timeout_ms = v;
        }
        if let Some(v) = env_parse("XDEBUG_BRIDGE_MAX_DEPTH") {
            self.max_depth = v;
        }
        if let Ok(v) = std::env::var("XDEBUG_BRIDGE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("XDEBUG_BRIDGE_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<()> {
        if self.port_range_end < self.port {
            return Err(Error::Config(format!(
                "port_range_end ({}) is below port ({})",
                self.port_range_end, self.port
            )));
        }
        Ok(())
    }

    /// Base directory for local path resolution
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Ledger and summary directory, `<project_root>/.xdebug-mcp` by default
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.project_root().join(".xdebug-mcp"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.port, 9003);
        assert_eq!(config.port_range_end, 9010);
        assert_eq!(config.connection_timeout_secs, 30);
        assert_eq!(config.watchdog_timeout_ms, 300_000);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.default_max_children, 20);
        assert!(!config.debug);
    }

    #[test]
    fn data_dir_defaults_under_project_root() {
        let mut config = Config::default();
        config.project_root = Some(PathBuf::from("/work/app"));
        assert_eq!(config.data_dir(), PathBuf::from("/work/app/.xdebug-mcp"));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let config = Config {
            port: 9010,
            port_range_end: 9003,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: Config = toml::from_str("port = 9100\ndebug = true").unwrap();
        assert_eq!(config.port, 9100);
        assert!(config.debug);
        assert_eq!(config.port_range_end, 9010);
    }
}
