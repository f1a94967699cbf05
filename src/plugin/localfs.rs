//! Host-directory backend.
//!
//! Mirrors a directory of the host filesystem under the mount, confining
//! every resolved path to the configured root.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;

use super::{require_str, ConfigMap, Plugin};
use crate::vfs::{
    path, read_range, FileInfo, FileSystem, FsError, FsResult, ReadHandle, WriteHandle,
    META_PLUGIN_NAME,
};

const README: &str = "\
localfs: a host-directory filesystem.

Configuration keys:
  local_dir  (required) absolute host directory backing the mount.

Paths are confined to local_dir; writes create missing parent directories.
";

/// Host-directory plugin. The provider is built during initialize.
pub struct LocalfsPlugin {
    fs: Option<Arc<LocalFs>>,
}

impl LocalfsPlugin {
    pub fn new() -> Self {
        Self { fs: None }
    }
}

impl Default for LocalfsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for LocalfsPlugin {
    fn name(&self) -> &str {
        "localfs"
    }

    async fn initialize(&mut self, config: &ConfigMap) -> FsResult<()> {
        let local_dir = require_str(config, "local_dir")?;
        let root = PathBuf::from(local_dir);
        let meta = fs::metadata(&root).await.map_err(|err| {
            FsError::invalid_config(format!("local_dir {local_dir}: {err}"))
        })?;
        if !meta.is_dir() {
            return Err(FsError::invalid_config(format!(
                "local_dir {local_dir}: not a directory"
            )));
        }
        let root = root.canonicalize().unwrap_or(root);
        self.fs = Some(Arc::new(LocalFs { root }));
        Ok(())
    }

    fn filesystem(&self) -> FsResult<Arc<dyn FileSystem>> {
        match &self.fs {
            Some(fs) => Ok(fs.clone()),
            None => Err(FsError::other("localfs is not initialized")),
        }
    }

    fn readme(&self) -> String {
        README.to_owned()
    }

    async fn shutdown(&self) -> FsResult<()> {
        Ok(())
    }
}

/// Provider rooted at a host directory.
struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Map a normalized mount-relative path onto the host tree.
    fn resolve(&self, raw: &str) -> FsResult<(String, PathBuf)> {
        let rel = path::normalize(raw)?;
        let host = if rel == "/" { self.root.clone() } else { self.root.join(&rel[1..]) };
        Ok((rel, host))
    }

    async fn info(&self, rel: &str, host: &Path) -> FsResult<FileInfo> {
        let meta = fs::metadata(host).await.map_err(|err| map_io(err, rel))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or_default();
        let mode = meta.permissions().mode() & 0o777;
        let info = if meta.is_dir() {
            FileInfo::dir(path::basename(rel), mode, mtime)
        } else {
            FileInfo::file(path::basename(rel), meta.len() as i64, mode, mtime)
        };
        Ok(info.with_meta(META_PLUGIN_NAME, "localfs"))
    }
}

fn map_io(err: std::io::Error, path: &str) -> FsError {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::NotFound => FsError::not_found(path),
        Io::PermissionDenied => FsError::permission_denied(format!("{path}: permission denied")),
        Io::AlreadyExists => FsError::already_exists(path),
        Io::DirectoryNotEmpty => FsError::not_empty(path),
        Io::IsADirectory => FsError::is_directory(path),
        Io::NotADirectory => FsError::not_a_directory(path),
        _ => FsError::other(format!("{path}: {err}")),
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn create(&self, raw: &str) -> FsResult<()> {
        let (rel, host) = self.resolve(raw)?;
        if let Ok(meta) = fs::metadata(&host).await {
            if meta.is_dir() {
                return Err(FsError::is_directory(&rel));
            }
        }
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&host)
            .await
            .map_err(|err| map_io(err, &rel))?;
        Ok(())
    }

    async fn mkdir(&self, raw: &str, perm: u32) -> FsResult<()> {
        let (rel, host) = self.resolve(raw)?;
        fs::create_dir(&host).await.map_err(|err| map_io(err, &rel))?;
        fs::set_permissions(&host, std::fs::Permissions::from_mode(perm & 0o777))
            .await
            .map_err(|err| map_io(err, &rel))?;
        Ok(())
    }

    async fn remove(&self, raw: &str) -> FsResult<()> {
        let (rel, host) = self.resolve(raw)?;
        let meta = fs::metadata(&host).await.map_err(|err| map_io(err, &rel))?;
        if meta.is_dir() {
            fs::remove_dir(&host).await.map_err(|err| map_io(err, &rel))
        } else {
            fs::remove_file(&host).await.map_err(|err| map_io(err, &rel))
        }
    }

    async fn remove_all(&self, raw: &str) -> FsResult<()> {
        let (rel, host) = self.resolve(raw)?;
        let meta = fs::metadata(&host).await.map_err(|err| map_io(err, &rel))?;
        if meta.is_dir() {
            fs::remove_dir_all(&host).await.map_err(|err| map_io(err, &rel))
        } else {
            fs::remove_file(&host).await.map_err(|err| map_io(err, &rel))
        }
    }

    async fn read(&self, raw: &str, offset: i64, size: i64) -> FsResult<(Vec<u8>, bool)> {
        let (rel, host) = self.resolve(raw)?;
        let meta = fs::metadata(&host).await.map_err(|err| map_io(err, &rel))?;
        if meta.is_dir() {
            return Err(FsError::is_directory(&rel));
        }
        let data = fs::read(&host).await.map_err(|err| map_io(err, &rel))?;
        Ok(read_range(&data, offset, size))
    }

    async fn write(&self, raw: &str, data: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let (rel, host) = self.resolve(raw)?;
        if let Ok(meta) = fs::metadata(&host).await {
            if meta.is_dir() {
                return Err(FsError::is_directory(&rel));
            }
        }
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).await.map_err(|err| map_io(err, &rel))?;
        }
        fs::write(&host, data).await.map_err(|err| map_io(err, &rel))?;
        Ok(None)
    }

    async fn readdir(&self, raw: &str) -> FsResult<Vec<FileInfo>> {
        let (rel, host) = self.resolve(raw)?;
        let meta = fs::metadata(&host).await.map_err(|err| map_io(err, &rel))?;
        if !meta.is_dir() {
            return Err(FsError::not_a_directory(&rel));
        }
        let mut dir = fs::read_dir(&host).await.map_err(|err| map_io(err, &rel))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|err| map_io(err, &rel))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = path::join(&rel, &name)?;
            entries.push(self.info(&child_rel, &entry.path()).await?);
        }
        Ok(entries)
    }

    async fn stat(&self, raw: &str) -> FsResult<FileInfo> {
        let (rel, host) = self.resolve(raw)?;
        self.info(&rel, &host).await
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let (old_rel, old_host) = self.resolve(old)?;
        let (new_rel, new_host) = self.resolve(new)?;
        fs::metadata(&old_host).await.map_err(|err| map_io(err, &old_rel))?;
        if fs::metadata(&new_host).await.is_ok() {
            return Err(FsError::already_exists(&new_rel));
        }
        fs::rename(&old_host, &new_host).await.map_err(|err| map_io(err, &old_rel))
    }

    async fn chmod(&self, raw: &str, mode: u32) -> FsResult<()> {
        let (rel, host) = self.resolve(raw)?;
        fs::set_permissions(&host, std::fs::Permissions::from_mode(mode & 0o777))
            .await
            .map_err(|err| map_io(err, &rel))
    }

    async fn open(&self, raw: &str) -> FsResult<ReadHandle> {
        let (rel, host) = self.resolve(raw)?;
        let file = fs::File::open(&host).await.map_err(|err| map_io(err, &rel))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, raw: &str) -> FsResult<WriteHandle> {
        let (rel, host) = self.resolve(raw)?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).await.map_err(|err| map_io(err, &rel))?;
        }
        let file = fs::File::create(&host).await.map_err(|err| map_io(err, &rel))?;
        Ok(Box::new(file))
    }
}
