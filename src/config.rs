//! Node configuration: defaults, optional YAML file, CLI overrides.
//!
//! Precedence is lowest to highest: built-in defaults, keys from the file
//! given with `--config`, explicit command-line flags.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Per-node settings. `hostname` doubles as the realm identity, the node id
/// on the bus, and the server name in IRC replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hostname: String,
    pub port: u16,
    /// SQLite database path. Every node of one cluster points at the same
    /// database.
    pub db: String,
    /// Admit unknown nicks on login instead of rejecting them.
    pub user_on_request: bool,
    /// Let JOIN create channels that exist nowhere in the cluster.
    pub group_on_request: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5799,
            db: "shardirc.db".to_string(),
            user_on_request: true,
            group_on_request: false,
        }
    }
}

/// CLI-provided overrides; `None` means "not given on the command line".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub db: Option<String>,
    pub user_on_request: Option<bool>,
    pub group_on_request: Option<bool>,
}

impl Config {
    /// Load from a YAML file, falling back to defaults for absent keys.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Resolve the final configuration from an optional file plus overrides.
    pub fn resolve(file: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut cfg = match file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        cfg.apply(overrides);
        Ok(cfg)
    }

    fn apply(&mut self, o: &Overrides) {
        if let Some(hostname) = &o.hostname {
            self.hostname = hostname.clone();
        }
        if let Some(port) = o.port {
            self.port = port;
        }
        if let Some(db) = &o.db {
            self.db = db.clone();
        }
        if let Some(flag) = o.user_on_request {
            self.user_on_request = flag;
        }
        if let Some(flag) = o.group_on_request {
            self.group_on_request = flag;
        }
    }

    /// `sqlite://` URL for the configured database path, created on demand.
    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.hostname, "localhost");
        assert_eq!(cfg.port, 5799);
        assert!(cfg.user_on_request);
        assert!(!cfg.group_on_request);
    }

    #[test]
    fn file_keys_override_defaults() {
        let yaml = "hostname: node-a\nport: 7000\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.hostname, "node-a");
        assert_eq!(cfg.port, 7000);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.db, "shardirc.db");
    }

    #[test]
    fn cli_wins_over_file() {
        let mut cfg: Config = serde_yaml::from_str("hostname: node-a\n").unwrap();
        cfg.apply(&Overrides {
            hostname: Some("node-b".into()),
            group_on_request: Some(true),
            ..Overrides::default()
        });
        assert_eq!(cfg.hostname, "node-b");
        assert!(cfg.group_on_request);
    }

    #[test]
    fn db_url_requests_create_mode() {
        let cfg = Config::default();
        assert_eq!(cfg.db_url(), "sqlite://shardirc.db?mode=rwc");
    }
}
