//! Server configuration.
//!
//! YAML with two top-level keys: `server` and `plugins`. Each plugins
//! entry is keyed by filesystem type and accepts either the
//! single-instance shape (`{enabled, path, config}`) or the multi-instance
//! shape (`{instances: [...]}`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::plugin::ConfigMap;
use crate::vfs::{FsError, FsResult};

fn default_address() -> String {
    "127.0.0.1:2333".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Fail the process when a startup mount cannot initialize; the
    /// default logs and continues with the remaining mounts.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_address(), log_level: default_log_level(), fail_fast: false }
    }
}

/// One mount of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Optional label distinguishing instances of the same type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Mount path in the namespace.
    pub path: String,
    #[serde(default)]
    pub config: ConfigMap,
}

/// Per-type plugin section; both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSection {
    Multi { instances: Vec<InstanceConfig> },
    Single(InstanceConfig),
}

impl PluginSection {
    pub fn instances(&self) -> &[InstanceConfig] {
        match self {
            Self::Multi { instances } => instances,
            Self::Single(instance) => std::slice::from_ref(instance),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSection>,
}

impl Config {
    pub fn from_yaml(text: &str) -> FsResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| FsError::invalid_config(format!("parsing configuration: {err}")))
    }

    pub fn load(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            FsError::invalid_config(format!("reading {}: {err}", path.display()))
        })?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;

    #[test]
    fn single_instance_shape_round_trips() {
        let yaml = "\
server:
  address: 0.0.0.0:9000
  log_level: debug
plugins:
  localfs:
    enabled: true
    path: /l
    config:
      local_dir: /srv/data
";
        let config = Config::from_yaml(yaml).expect("parse");
        assert_eq!(config.server.address, "0.0.0.0:9000");
        assert_eq!(config.server.log_level, "debug");
        assert!(!config.server.fail_fast);

        let section = config.plugins.get("localfs").expect("section");
        let instances = section.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].path, "/l");
        assert!(instances[0].enabled);
        assert_eq!(
            instances[0].config.get("local_dir").and_then(|v| v.as_str()),
            Some("/srv/data")
        );

        let rendered = serde_yaml::to_string(&config).expect("render");
        let back = Config::from_yaml(&rendered).expect("reparse");
        assert_eq!(back, config);
    }

    #[test]
    fn multi_instance_shape_round_trips() {
        let yaml = "\
plugins:
  memfs:
    instances:
      - name: scratch
        path: /scratch
      - name: cache
        enabled: false
        path: /cache
";
        let config = Config::from_yaml(yaml).expect("parse");
        assert_eq!(config.server, ServerConfig::default());

        let section = config.plugins.get("memfs").expect("section");
        let instances = section.instances();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name.as_deref(), Some("scratch"));
        assert!(instances[0].enabled);
        assert!(!instances[1].enabled);

        let rendered = serde_yaml::to_string(&config).expect("render");
        let back = Config::from_yaml(&rendered).expect("reparse");
        assert_eq!(back, config);
    }

    #[test]
    fn malformed_yaml_is_invalid_config() {
        let err = Config::from_yaml("server: [not a map").expect_err("parse error");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").expect("parse");
        assert_eq!(config.server.address, "127.0.0.1:2333");
        assert!(config.plugins.is_empty());
    }
}
