//! In-memory tree provider.
//!
//! The reference [`FileSystem`] implementation. Used directly by the memfs
//! plugin and embedded in other plugins to expose virtual sub-hierarchies
//! (control files, READMEs). The whole tree sits behind one reader/writer
//! lock; every operation is synchronous under the guard.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use super::path;
use super::{
    read_range, FileInfo, FileSystem, FsError, FsResult, ReadHandle, StreamReader,
    StreamingFileSystem, WriteHandle, META_PLUGIN_NAME,
};

/// Read chunk size served by the streaming capability.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    mode: u32,
    mtime: i64,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self { is_dir: true, data: Vec::new(), mode, mtime: now(), children: BTreeMap::new() }
    }

    fn file(data: Vec<u8>) -> Self {
        Self { is_dir: false, data, mode: 0o644, mtime: now(), children: BTreeMap::new() }
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[derive(Debug)]
struct Inner {
    plugin_name: String,
    root: RwLock<Node>,
}

/// Rooted tree of in-memory nodes. Cheap to clone; clones share the tree.
#[derive(Debug, Clone)]
pub struct MemTree {
    inner: Arc<Inner>,
}

impl MemTree {
    /// Empty tree stamping `plugin_name` into every entry it reports.
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                plugin_name: plugin_name.into(),
                root: RwLock::new(Node::dir(0o755)),
            }),
        }
    }

    /// Seed a file, creating intermediate directories. For plugins building
    /// virtual hierarchies before serving.
    pub fn seed(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::is_directory("/"));
        }
        let mut root = self.inner.lock_write();
        let mut node = &mut *root;
        let components: Vec<&str> = path[1..].split('/').collect();
        let (last, dirs) = components.split_last().unwrap_or((&"", &[]));
        for component in dirs {
            node = node
                .children
                .entry((*component).to_owned())
                .or_insert_with(|| Node::dir(0o755));
            if !node.is_dir {
                return Err(FsError::not_a_directory(&path));
            }
        }
        node.children.insert((*last).to_owned(), Node::file(data.to_vec()));
        Ok(())
    }
}

impl Inner {
    fn lock_read(&self) -> RwLockReadGuard<'_, Node> {
        self.root.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, Node> {
        self.root.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn info_for(&self, name: &str, node: &Node) -> FileInfo {
        let info = if node.is_dir {
            FileInfo::dir(name, node.mode, node.mtime)
        } else {
            FileInfo::file(name, node.data.len() as i64, node.mode, node.mtime)
        };
        info.with_meta(META_PLUGIN_NAME, self.plugin_name.clone())
    }

    /// Replace file contents wholesale, creating the file when absent.
    fn write_whole(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::is_directory(&path));
        }
        let mut root = self.lock_write();
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        match parent.children.get_mut(name) {
            Some(node) if node.is_dir => Err(FsError::is_directory(&path)),
            Some(node) => {
                node.data = data.to_vec();
                node.mtime = now();
                Ok(())
            }
            None => {
                parent.children.insert(name.to_owned(), Node::file(data.to_vec()));
                Ok(())
            }
        }
    }
}

fn locate<'a>(root: &'a Node, path: &str) -> FsResult<&'a Node> {
    let mut node = root;
    if path == "/" {
        return Ok(node);
    }
    for component in path[1..].split('/') {
        if !node.is_dir {
            return Err(FsError::not_a_directory(path));
        }
        node = node.children.get(component).ok_or_else(|| FsError::not_found(path))?;
    }
    Ok(node)
}

/// Resolve the parent directory of `path` (which must not be the root) and
/// return it together with the final component.
fn locate_parent_mut<'a>(root: &'a mut Node, path: &'a str) -> FsResult<(&'a mut Node, &'a str)> {
    let split = path.rfind('/').unwrap_or(0);
    let (parent_path, name) = (&path[..split], &path[split + 1..]);
    let mut node = root;
    if !parent_path.is_empty() {
        for component in parent_path[1..].split('/') {
            if !node.is_dir {
                return Err(FsError::not_a_directory(path));
            }
            node = node
                .children
                .get_mut(component)
                .ok_or_else(|| FsError::not_found(parent_path))?;
        }
    }
    if !node.is_dir {
        return Err(FsError::not_a_directory(parent_path));
    }
    Ok((node, name))
}

#[async_trait]
impl FileSystem for MemTree {
    async fn create(&self, path: &str) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::is_directory(&path));
        }
        let mut root = self.inner.lock_write();
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        match parent.children.get(name) {
            Some(node) if node.is_dir => Err(FsError::is_directory(&path)),
            Some(_) => Err(FsError::already_exists(&path)),
            None => {
                parent.children.insert(name.to_owned(), Node::file(Vec::new()));
                Ok(())
            }
        }
    }

    async fn mkdir(&self, path: &str, perm: u32) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::already_exists(&path));
        }
        let mut root = self.inner.lock_write();
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        if parent.children.contains_key(name) {
            return Err(FsError::already_exists(&path));
        }
        parent.children.insert(name.to_owned(), Node::dir(perm & 0o777));
        Ok(())
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::permission_denied("the root is not removable"));
        }
        let mut root = self.inner.lock_write();
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        match parent.children.get(name) {
            None => Err(FsError::not_found(&path)),
            Some(node) if node.is_dir && !node.children.is_empty() => {
                Err(FsError::not_empty(&path))
            }
            Some(_) => {
                parent.children.remove(name);
                Ok(())
            }
        }
    }

    async fn remove_all(&self, path: &str) -> FsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::permission_denied("the root is not removable"));
        }
        let mut root = self.inner.lock_write();
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        if parent.children.remove(name).is_none() {
            return Err(FsError::not_found(&path));
        }
        Ok(())
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> FsResult<(Vec<u8>, bool)> {
        let path = path::normalize(path)?;
        let root = self.inner.lock_read();
        let node = locate(&root, &path)?;
        if node.is_dir {
            return Err(FsError::is_directory(&path));
        }
        Ok(read_range(&node.data, offset, size))
    }

    async fn write(&self, path: &str, data: &[u8]) -> FsResult<Option<Vec<u8>>> {
        self.inner.write_whole(path, data)?;
        Ok(None)
    }

    async fn readdir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = path::normalize(path)?;
        let root = self.inner.lock_read();
        let node = locate(&root, &path)?;
        if !node.is_dir {
            return Err(FsError::not_a_directory(&path));
        }
        Ok(node
            .children
            .iter()
            .map(|(name, child)| self.inner.info_for(name, child))
            .collect())
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = path::normalize(path)?;
        let root = self.inner.lock_read();
        let node = locate(&root, &path)?;
        Ok(self.inner.info_for(path::basename(&path), node))
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let old = path::normalize(old)?;
        let new = path::normalize(new)?;
        if old == "/" {
            return Err(FsError::permission_denied("the root is not movable"));
        }
        if old == new {
            return Ok(());
        }
        if path::is_under(&old, &new) {
            return Err(FsError::invalid_argument(format!(
                "{old} -> {new}: cannot move an entry beneath itself"
            )));
        }
        let mut root = self.inner.lock_write();
        locate(&root, &old)?;
        if locate(&root, &new).is_ok() {
            return Err(FsError::already_exists(&new));
        }
        let new_parent_path = path::parent(&new);
        if !locate(&root, new_parent_path)?.is_dir {
            return Err(FsError::not_a_directory(new_parent_path));
        }
        let (old_parent, old_name) = locate_parent_mut(&mut root, &old)?;
        let node = old_parent.children.remove(old_name).ok_or_else(|| FsError::not_found(&old))?;
        let (new_parent, new_name) = locate_parent_mut(&mut root, &new)?;
        new_parent.children.insert(new_name.to_owned(), node);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let path = path::normalize(path)?;
        let mut root = self.inner.lock_write();
        if path == "/" {
            root.mode = mode & 0o777;
            return Ok(());
        }
        let (parent, name) = locate_parent_mut(&mut root, &path)?;
        let node = parent.children.get_mut(name).ok_or_else(|| FsError::not_found(&path))?;
        node.mode = mode & 0o777;
        Ok(())
    }

    async fn open(&self, path: &str) -> FsResult<ReadHandle> {
        let (data, _) = self.read(path, 0, -1).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn open_write(&self, path: &str) -> FsResult<WriteHandle> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(FsError::is_directory(&path));
        }
        {
            // Surface a missing parent or a directory target at open time
            // rather than at commit.
            let mut root = self.inner.lock_write();
            let (parent, name) = locate_parent_mut(&mut root, &path)?;
            if let Some(node) = parent.children.get(name) {
                if node.is_dir {
                    return Err(FsError::is_directory(&path));
                }
            }
        }
        Ok(Box::new(MemWriter { inner: self.inner.clone(), path, buffer: Vec::new() }))
    }

    fn streaming(&self) -> Option<&dyn StreamingFileSystem> {
        Some(self)
    }
}

#[async_trait]
impl StreamingFileSystem for MemTree {
    async fn open_stream(&self, path: &str) -> FsResult<Box<dyn StreamReader>> {
        let (data, _) = self.read(path, 0, -1).await?;
        Ok(Box::new(MemStream { data: Bytes::from(data) }))
    }
}

struct MemStream {
    data: Bytes,
}

#[async_trait]
impl StreamReader for MemStream {
    async fn next_chunk(&mut self) -> FsResult<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let take = self.data.len().min(STREAM_CHUNK);
        Ok(Some(self.data.split_to(take)))
    }
}

/// Buffering write handle; the tree is updated wholesale on shutdown.
struct MemWriter {
    inner: Arc<Inner>,
    path: String,
    buffer: Vec<u8>,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.inner
            .write_whole(&this.path, &this.buffer)
            .map_err(std::io::Error::other)?;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn tree() -> MemTree {
        MemTree::new("memfs")
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let fs = tree();
        fs.write("/hello", b"hi").await.expect("write");
        let (data, eof) = fs.read("/hello", 0, -1).await.expect("read");
        assert_eq!(data, b"hi");
        assert!(eof);
    }

    #[tokio::test]
    async fn create_requires_parent_and_rejects_duplicates() {
        let fs = tree();
        let err = fs.create("/missing/file").await.expect_err("no parent");
        assert_eq!(err.kind, ErrorKind::NotFound);

        fs.mkdir("/dir", 0o755).await.expect("mkdir");
        fs.create("/dir/file").await.expect("create");
        let err = fs.create("/dir/file").await.expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        let err = fs.create("/dir").await.expect_err("directory target");
        assert_eq!(err.kind, ErrorKind::IsDirectory);
    }

    #[tokio::test]
    async fn remove_refuses_nonempty_directories_and_root() {
        let fs = tree();
        fs.mkdir("/dir", 0o755).await.expect("mkdir");
        fs.write("/dir/file", b"x").await.expect("write");

        let err = fs.remove("/dir").await.expect_err("not empty");
        assert_eq!(err.kind, ErrorKind::NotEmpty);
        let err = fs.remove("/").await.expect_err("root");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        fs.remove_all("/dir").await.expect("remove_all");
        let err = fs.stat("/dir").await.expect_err("gone");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rename_moves_between_parents() {
        let fs = tree();
        fs.mkdir("/a", 0o755).await.expect("mkdir a");
        fs.mkdir("/b", 0o755).await.expect("mkdir b");
        fs.write("/a/f", b"data").await.expect("write");

        fs.rename("/a/f", "/b/g").await.expect("rename");
        assert_eq!(fs.read("/b/g", 0, -1).await.expect("read").0, b"data");
        assert_eq!(fs.stat("/a/f").await.expect_err("moved").kind, ErrorKind::NotFound);

        fs.write("/a/f", b"other").await.expect("write");
        let err = fs.rename("/a/f", "/b/g").await.expect_err("occupied");
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        let err = fs.rename("/b", "/b/inside").await.expect_err("self-nesting");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn readdir_lists_children_with_meta() {
        let fs = tree();
        fs.mkdir("/dir", 0o750).await.expect("mkdir");
        fs.write("/note", b"n").await.expect("write");

        let entries = fs.readdir("/").await.expect("readdir");
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["dir", "note"]);
        for entry in &entries {
            assert_eq!(entry.meta.get(META_PLUGIN_NAME).map(String::as_str), Some("memfs"));
        }

        let err = fs.readdir("/note").await.expect_err("file");
        assert_eq!(err.kind, ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn chmod_updates_mode() {
        let fs = tree();
        fs.write("/f", b"x").await.expect("write");
        fs.chmod("/f", 0o600).await.expect("chmod");
        assert_eq!(fs.stat("/f").await.expect("stat").mode, 0o600);
    }

    #[tokio::test]
    async fn open_write_commits_on_shutdown() {
        let fs = tree();
        let mut handle = fs.open_write("/f").await.expect("open_write");
        handle.write_all(b"streamed").await.expect("write");
        handle.shutdown().await.expect("shutdown");

        let mut reader = fs.open("/f").await.expect("open");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"streamed");
    }

    #[tokio::test]
    async fn streaming_yields_all_chunks() {
        let fs = tree();
        let blob = vec![7u8; STREAM_CHUNK + 100];
        fs.write("/blob", &blob).await.expect("write");

        let mut stream =
            fs.streaming().expect("capability").open_stream("/blob").await.expect("open_stream");
        let mut total = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.expect("chunk") {
            total.extend_from_slice(&chunk);
        }
        assert_eq!(total, blob);
    }

    #[tokio::test]
    async fn seed_builds_intermediate_directories() {
        let fs = tree();
        fs.seed("/docs/guide/README.md", b"hello").expect("seed");

        assert!(fs.stat("/docs/guide").await.expect("stat").is_dir);
        let (data, _) = fs.read("/docs/guide/README.md", 0, -1).await.expect("read");
        assert_eq!(data, b"hello");
    }
}
