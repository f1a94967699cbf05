//! Mount table: composes providers under a single namespace.
//!
//! Providers register at absolute paths; every operation routes to the
//! mount whose path is the longest prefix of the target. Ancestors of
//! mount points that no provider owns are virtual directories synthesized
//! during `stat` and `readdir`, which keeps multi-level organizational
//! paths browsable while exactly one provider serves any mounted path.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::plugin::{ConfigMap, Plugin, PluginRegistry};
use crate::vfs::{
    path, ErrorKind, FileInfo, FileSystem, FsError, FsResult, ReadHandle, StreamHandle,
    StreamReader, StreamingFileSystem, WriteHandle, META_PLUGIN_NAME, META_TYPE,
    TYPE_MOUNT_POINT, TYPE_ROOT,
};

/// A provider bound into the namespace.
pub struct Mount {
    pub path: String,
    pub fstype: String,
    pub plugin: Arc<dyn Plugin>,
    pub fs: Arc<dyn FileSystem>,
}

/// Row of the `GET /mounts` listing.
#[derive(Debug, Clone, Serialize)]
pub struct MountEntry {
    pub path: String,
    pub fstype: String,
}

#[derive(Default)]
struct MountState {
    mounts: HashMap<String, Arc<Mount>>,
    /// Mount paths by descending length, ties lexicographic. Derived from
    /// `mounts` on every mutation; `mounts` is the source of truth.
    ordered: Vec<String>,
}

impl MountState {
    fn insert(&mut self, mount: Mount) {
        self.mounts.insert(mount.path.clone(), Arc::new(mount));
        self.resort();
    }

    fn remove(&mut self, path: &str) {
        self.mounts.remove(path);
        self.resort();
    }

    fn resort(&mut self) {
        self.ordered = self.mounts.keys().cloned().collect();
        self.ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }
}

/// The aggregated filesystem.
///
/// Implements [`FileSystem`] itself, so clients (the HTTP adapter, sandbox
/// host callbacks) dispatch through one surface.
pub struct MountableFs {
    state: RwLock<MountState>,
    registry: Arc<PluginRegistry>,
}

impl MountableFs {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { state: RwLock::new(MountState::default()), registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Mount a provider constructed through the factory registry.
    ///
    /// The table lock is not held while the provider initializes: a
    /// sandboxed plugin may call back into the mount table during its own
    /// initialize.
    pub async fn mount(&self, fstype: &str, raw_path: &str, config: &ConfigMap) -> FsResult<()> {
        let mount_path = path::normalize(raw_path)?;
        {
            let state = self.state.read().await;
            if state.mounts.contains_key(&mount_path) {
                return Err(FsError::already_mounted(&mount_path));
            }
        }
        let mut plugin = self.registry.create(fstype)?;
        if let Err(err) = plugin.initialize(config).await {
            warn!(fstype, path = %mount_path, error = %err, "plugin initialize failed");
            let err = match err.kind {
                ErrorKind::Other => FsError::init_failed(err.message),
                _ => err,
            };
            return Err(err.with_context(&format!("mount {fstype} at {mount_path}")));
        }
        let plugin: Arc<dyn Plugin> = Arc::from(plugin);
        let fs = plugin.filesystem()?;
        let mut state = self.state.write().await;
        if state.mounts.contains_key(&mount_path) {
            // Lost a race against a concurrent mount; the fresh provider is
            // discarded without ever being reachable.
            return Err(FsError::already_mounted(&mount_path));
        }
        state.insert(Mount { path: mount_path.clone(), fstype: fstype.to_owned(), plugin, fs });
        info!(fstype, path = %mount_path, "mounted");
        Ok(())
    }

    /// Mount an already-initialized provider.
    pub async fn mount_provider(&self, raw_path: &str, plugin: Arc<dyn Plugin>) -> FsResult<()> {
        let mount_path = path::normalize(raw_path)?;
        let mut state = self.state.write().await;
        if state.mounts.contains_key(&mount_path) {
            return Err(FsError::already_mounted(&mount_path));
        }
        let fs = plugin.filesystem()?;
        let fstype = plugin.name().to_owned();
        state.insert(Mount { path: mount_path.clone(), fstype, plugin, fs });
        info!(path = %mount_path, "mounted");
        Ok(())
    }

    /// Remove a mount. The provider's shutdown runs first; a shutdown
    /// failure leaves the mount in place.
    pub async fn unmount(&self, raw_path: &str) -> FsResult<()> {
        let mount_path = path::normalize(raw_path)?;
        let mut state = self.state.write().await;
        let mount = state
            .mounts
            .get(&mount_path)
            .cloned()
            .ok_or_else(|| FsError::new(ErrorKind::NotMounted, format!("{mount_path}: not mounted")))?;
        if let Err(err) = mount.plugin.shutdown().await {
            warn!(path = %mount_path, error = %err, "plugin shutdown failed; mount kept");
            return Err(FsError::shutdown_failed(format!("{mount_path}: {}", err.message)));
        }
        state.remove(&mount_path);
        info!(path = %mount_path, "unmounted");
        Ok(())
    }

    /// Current mounts, sorted by path.
    pub async fn mounts(&self) -> Vec<MountEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<MountEntry> = state
            .mounts
            .values()
            .map(|mount| MountEntry { path: mount.path.clone(), fstype: mount.fstype.clone() })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// README of the plugin mounted at `raw_path`.
    pub async fn readme(&self, raw_path: &str) -> FsResult<String> {
        let mount_path = path::normalize(raw_path)?;
        let state = self.state.read().await;
        let mount = state
            .mounts
            .get(&mount_path)
            .ok_or_else(|| FsError::new(ErrorKind::NotMounted, format!("{mount_path}: not mounted")))?;
        Ok(mount.plugin.readme())
    }

    /// Resolve the owning mount of a normalized path. The table lock is
    /// released before the caller invokes the provider.
    async fn find(&self, normalized: &str) -> Option<(Arc<Mount>, String)> {
        let state = self.state.read().await;
        for mount_path in &state.ordered {
            let Some(mount) = state.mounts.get(mount_path) else {
                continue;
            };
            if mount_path == "/" {
                return Some((mount.clone(), normalized.to_owned()));
            }
            if normalized == *mount_path {
                return Some((mount.clone(), "/".to_owned()));
            }
            if path::is_under(mount_path, normalized) {
                return Some((mount.clone(), normalized[mount_path.len()..].to_owned()));
            }
        }
        None
    }

    async fn locate(&self, raw: &str) -> FsResult<(Arc<Mount>, String)> {
        let normalized = path::normalize(raw)?;
        match self.find(&normalized).await {
            Some(hit) => Ok(hit),
            None => Err(FsError::no_mount(&normalized)),
        }
    }

    /// True when `normalized` is a strict ancestor of at least one mount.
    async fn is_virtual_ancestor(&self, normalized: &str) -> bool {
        let state = self.state.read().await;
        state.mounts.keys().any(|mount_path| path::is_under(normalized, mount_path))
    }

    async fn open_stream_inner(&self, raw: &str) -> FsResult<Box<dyn StreamReader>> {
        let (mount, rel) = self.locate(raw).await?;
        match mount.fs.streaming() {
            Some(streaming) => {
                debug!(path = %mount.path, rel = %rel, "streaming read");
                streaming.open_stream(&rel).await.map_err(|err| err.with_context(&mount.path))
            }
            None => Err(FsError::streaming_unsupported(raw)),
        }
    }

    /// Legacy streaming surface returning an opaque read handle.
    #[deprecated(note = "use `open_stream`; the typed `StreamReader` surface is canonical")]
    pub async fn open_stream_handle(&self, raw: &str) -> FsResult<StreamHandle> {
        Ok(StreamHandle::new(self.open_stream_inner(raw).await?))
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Entry for the namespace root.
fn root_info() -> FileInfo {
    FileInfo::dir("/", 0o755, now())
        .with_meta(META_TYPE, TYPE_ROOT)
        .with_meta(META_PLUGIN_NAME, "rootfs")
}

/// Entry for a virtual ancestor of one or more mount points.
fn synthetic_dir(name: &str) -> FileInfo {
    FileInfo::dir(name, 0o755, now())
        .with_meta(META_TYPE, TYPE_MOUNT_POINT)
        .with_meta(META_PLUGIN_NAME, "rootfs")
}

#[async_trait]
impl FileSystem for MountableFs {
    async fn create(&self, raw: &str) -> FsResult<()> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.create(&rel).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn mkdir(&self, raw: &str, perm: u32) -> FsResult<()> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.mkdir(&rel, perm).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn remove(&self, raw: &str) -> FsResult<()> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.remove(&rel).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn remove_all(&self, raw: &str) -> FsResult<()> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.remove_all(&rel).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn read(&self, raw: &str, offset: i64, size: i64) -> FsResult<(Vec<u8>, bool)> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.read(&rel, offset, size).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn write(&self, raw: &str, data: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.write(&rel, data).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn readdir(&self, raw: &str) -> FsResult<Vec<FileInfo>> {
        let normalized = path::normalize(raw)?;
        if normalized == "/" {
            // One entry per distinct first component of the mount set, not
            // one per mount.
            let state = self.state.read().await;
            let mut components = BTreeSet::new();
            for mount_path in state.mounts.keys() {
                if let Some(component) = path::first_component(mount_path) {
                    components.insert(component.to_owned());
                }
            }
            return Ok(components.iter().map(|c| synthetic_dir(c)).collect());
        }
        if let Some((mount, rel)) = self.find(&normalized).await {
            return mount.fs.readdir(&rel).await.map_err(|err| err.with_context(&mount.path));
        }
        // Virtual ancestor: list the next component of every mount below.
        let state = self.state.read().await;
        let mut components = BTreeSet::new();
        for mount_path in state.mounts.keys() {
            if path::is_under(&normalized, mount_path) {
                if let Some(component) = mount_path[normalized.len() + 1..].split('/').next() {
                    if !component.is_empty() {
                        components.insert(component.to_owned());
                    }
                }
            }
        }
        if components.is_empty() {
            return Err(FsError::no_mount(&normalized));
        }
        Ok(components.iter().map(|c| synthetic_dir(c)).collect())
    }

    async fn stat(&self, raw: &str) -> FsResult<FileInfo> {
        let normalized = path::normalize(raw)?;
        if normalized == "/" {
            return Ok(root_info());
        }
        if let Some((mount, rel)) = self.find(&normalized).await {
            let mut info =
                mount.fs.stat(&rel).await.map_err(|err| err.with_context(&mount.path))?;
            if rel == "/" && (info.name == "/" || info.name.is_empty()) {
                info.name = path::basename(&mount.path).to_owned();
            }
            return Ok(info);
        }
        if self.is_virtual_ancestor(&normalized).await {
            return Ok(synthetic_dir(path::basename(&normalized)));
        }
        Err(FsError::not_found(&normalized))
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        // Precedence: a source outside any mount reports the missing mount;
        // a resolved source with a foreign destination is a cross-mount
        // rename.
        let (mount, old_rel) = self.locate(old).await?;
        let new_normalized = path::normalize(new)?;
        match self.find(&new_normalized).await {
            Some((target, new_rel)) if Arc::ptr_eq(&target, &mount) => {
                mount.fs.rename(&old_rel, &new_rel).await.map_err(|err| err.with_context(&mount.path))
            }
            _ => Err(FsError::cross_mount_rename(old, new)),
        }
    }

    async fn chmod(&self, raw: &str, mode: u32) -> FsResult<()> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.chmod(&rel, mode).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn open(&self, raw: &str) -> FsResult<ReadHandle> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.open(&rel).await.map_err(|err| err.with_context(&mount.path))
    }

    async fn open_write(&self, raw: &str) -> FsResult<WriteHandle> {
        let (mount, rel) = self.locate(raw).await?;
        mount.fs.open_write(&rel).await.map_err(|err| err.with_context(&mount.path))
    }

    fn streaming(&self) -> Option<&dyn StreamingFileSystem> {
        Some(self)
    }
}

#[async_trait]
impl StreamingFileSystem for MountableFs {
    async fn open_stream(&self, raw: &str) -> FsResult<Box<dyn StreamReader>> {
        self.open_stream_inner(raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::MemfsPlugin;

    async fn table() -> Arc<MountableFs> {
        Arc::new(MountableFs::new(Arc::new(PluginRegistry::builtin())))
    }

    async fn mount_memfs(fs: &MountableFs, at: &str) {
        fs.mount("memfs", at, &ConfigMap::new()).await.expect("mount memfs");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let fs = table().await;
        mount_memfs(&fs, "/data").await;
        mount_memfs(&fs, "/data/hot").await;

        let (mount, rel) = fs.find("/data/hot/x").await.expect("find");
        assert_eq!(mount.path, "/data/hot");
        assert_eq!(rel, "/x");

        let (mount, rel) = fs.find("/data/cold").await.expect("find");
        assert_eq!(mount.path, "/data");
        assert_eq!(rel, "/cold");

        assert!(fs.find("/elsewhere").await.is_none());
    }

    #[tokio::test]
    async fn mount_then_unmount_restores_state() {
        let fs = table().await;
        mount_memfs(&fs, "/m").await;
        assert_eq!(fs.mounts().await.len(), 1);

        let err = fs.mount("memfs", "/m", &ConfigMap::new()).await.expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::AlreadyMounted);

        fs.unmount("/m").await.expect("unmount");
        assert!(fs.mounts().await.is_empty());
        assert!(fs.find("/m/x").await.is_none());

        let err = fs.unmount("/m").await.expect_err("gone");
        assert_eq!(err.kind, ErrorKind::NotMounted);
    }

    #[tokio::test]
    async fn unknown_fstype_is_rejected() {
        let fs = table().await;
        let err = fs.mount("nope", "/n", &ConfigMap::new()).await.expect_err("unknown");
        assert_eq!(err.kind, ErrorKind::UnknownFsType);
    }

    #[tokio::test]
    async fn init_failure_discards_the_mount() {
        let fs = table().await;
        // localfs requires local_dir.
        let err = fs.mount("localfs", "/l", &ConfigMap::new()).await.expect_err("bad config");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
        assert!(fs.mounts().await.is_empty());
    }

    #[tokio::test]
    async fn root_mount_is_the_fallback() {
        let fs = table().await;
        mount_memfs(&fs, "/").await;
        mount_memfs(&fs, "/special").await;

        let (mount, rel) = fs.find("/anything/else").await.expect("find");
        assert_eq!(mount.path, "/");
        assert_eq!(rel, "/anything/else");

        let (mount, _) = fs.find("/special/file").await.expect("find");
        assert_eq!(mount.path, "/special");
    }

    #[tokio::test]
    async fn provider_root_stat_takes_the_mount_name() {
        let fs = table().await;
        mount_memfs(&fs, "/docs").await;

        let info = fs.stat("/docs").await.expect("stat");
        assert_eq!(info.name, "docs");
        assert!(info.is_dir);
    }

    #[tokio::test]
    async fn static_mount_form_accepts_a_ready_provider() {
        let fs = table().await;
        let mut plugin = MemfsPlugin::new();
        plugin.initialize(&ConfigMap::new()).await.expect("initialize");
        fs.mount_provider("/mem", Arc::new(plugin)).await.expect("mount");

        fs.write("/mem/f", b"x").await.expect("write");
        assert_eq!(fs.read("/mem/f", 0, -1).await.expect("read").0, b"x");
        assert!(fs.readme("/mem").await.expect("readme").contains("memfs"));
    }
}
