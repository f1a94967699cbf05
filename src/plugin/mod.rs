//! Plugin contract and factory registry.
//!
//! A plugin is a filesystem provider plus its lifecycle metadata: a name, a
//! README, typed-enough configuration, and initialize/shutdown hooks. The
//! registry maps filesystem type names to factories; the static table is
//! installed at process start and dynamic loads extend it with factories
//! wrapping sandbox instantiation.

mod localfs;
mod memfs;

pub use localfs::LocalfsPlugin;
pub use memfs::MemfsPlugin;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::vfs::{FileSystem, FsError, FsResult};

/// Schema-less plugin configuration. Each plugin documents the keys it
/// recognizes; unknown keys are ignored.
pub type ConfigMap = BTreeMap<String, serde_json::Value>;

/// String-valued config accessor.
pub fn config_str<'a>(config: &'a ConfigMap, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|value| value.as_str())
}

/// String-valued config accessor that fails `InvalidConfig` on a miss.
pub fn require_str<'a>(config: &'a ConfigMap, key: &str) -> FsResult<&'a str> {
    config_str(config, key)
        .ok_or_else(|| FsError::invalid_config(format!("missing required config key `{key}`")))
}

/// Provider lifecycle interface.
///
/// A plugin is constructed by its factory, initialized once with its config
/// map, then serves through [`Plugin::filesystem`] until shutdown.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Filesystem type name (`memfs`, `localfs`, ...).
    fn name(&self) -> &str;

    /// Validate configuration and build internal state. Called exactly once,
    /// before the plugin is reachable from the mount table.
    async fn initialize(&mut self, config: &ConfigMap) -> FsResult<()>;

    /// The provider serving this plugin's subtree. Only valid after a
    /// successful [`Plugin::initialize`].
    fn filesystem(&self) -> FsResult<Arc<dyn FileSystem>>;

    /// Human-oriented usage text.
    fn readme(&self) -> String;

    /// Release resources. A failure leaves the mount in place.
    async fn shutdown(&self) -> FsResult<()>;
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plugin({})", self.name())
    }
}

/// Constructor indirection shared by static and dynamically loaded plugins.
pub type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Name -> factory table.
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { factories: RwLock::new(HashMap::new()) }
    }

    /// Registry pre-populated with the built-in plugin table.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register("memfs", Box::new(|| Box::new(MemfsPlugin::new())));
        registry.register("localfs", Box::new(|| Box::new(LocalfsPlugin::new())));
        registry
    }

    /// Install or replace a factory.
    pub fn register(&self, name: &str, factory: PluginFactory) {
        let mut factories =
            self.factories.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.insert(name.to_owned(), factory);
    }

    /// Construct an uninitialized plugin instance.
    pub fn create(&self, name: &str) -> FsResult<Box<dyn Plugin>> {
        let factories = self.factories.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let factory = factories.get(name).ok_or_else(|| FsError::unknown_fs_type(name))?;
        Ok(factory())
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        let factories = self.factories.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.contains_key(name)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;

    #[test]
    fn builtin_table_contains_static_plugins() {
        let registry = PluginRegistry::builtin();
        assert_eq!(registry.names(), ["localfs", "memfs"]);
        assert!(registry.contains("memfs"));

        let err = registry.create("nope").expect_err("unknown type");
        assert_eq!(err.kind, ErrorKind::UnknownFsType);
    }

    #[test]
    fn config_accessors() {
        let mut config = ConfigMap::new();
        config.insert("local_dir".into(), serde_json::Value::String("/tmp/x".into()));

        assert_eq!(config_str(&config, "local_dir"), Some("/tmp/x"));
        assert_eq!(config_str(&config, "missing"), None);
        let err = require_str(&config, "missing").expect_err("required");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }
}
