//! Defines the filesystem provider interface --- [`FileSystem`].
//!
//! Every backend mounted into the namespace implements this contract; the
//! mount table dispatches against it and is itself an implementation, so
//! callers see one uniform surface regardless of how many providers are
//! composed underneath.

pub mod memory;
pub mod path;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Result of [`FileSystem`] operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Maximum length of names passed into [`FileSystem`] methods.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of file paths passed into [`FileSystem`] methods.
pub const MAX_PATH_LEN: usize = 1024;

/// Closed set of error kinds shared by every provider.
///
/// Kinds pass through the mount table unchanged; only the message may gain
/// mount context. The HTTP adapter maps each kind onto a status code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The file or directory does not exist.
    NotFound,
    /// The target name already exists.
    AlreadyExists,
    /// A directory removal found remaining children.
    NotEmpty,
    /// A directory operation was applied to a non-directory.
    NotADirectory,
    /// A file operation was applied to a directory.
    IsDirectory,
    /// The caller is not allowed to perform the operation.
    PermissionDenied,
    /// An argument failed validation (bad path, bad range).
    InvalidArgument,
    /// A plugin configuration is missing required keys or is malformed.
    InvalidConfig,
    /// A mount already exists at exactly this path.
    AlreadyMounted,
    /// No mount owns the path.
    NotMounted,
    /// Rename endpoints resolve into different mounts.
    CrossMountRename,
    /// The plugin registry has no factory under this name.
    UnknownFsType,
    /// Provider initialization failed during mount.
    InitFailed,
    /// Provider shutdown failed during unmount; the mount stays in place.
    ShutdownFailed,
    /// The provider does not implement the streaming capability.
    StreamingUnsupported,
    /// A sandboxed call exceeded its per-call budget.
    DeadlineExceeded,
    /// Anything that does not map onto the kinds above.
    Other,
}

/// [`FileSystem`] error: a kind from the closed set plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct FsError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{path}: no such file or directory"))
    }

    pub fn already_exists(path: &str) -> Self {
        Self::new(ErrorKind::AlreadyExists, format!("{path}: already exists"))
    }

    pub fn not_empty(path: &str) -> Self {
        Self::new(ErrorKind::NotEmpty, format!("{path}: directory not empty"))
    }

    pub fn not_a_directory(path: &str) -> Self {
        Self::new(ErrorKind::NotADirectory, format!("{path}: not a directory"))
    }

    pub fn is_directory(path: &str) -> Self {
        Self::new(ErrorKind::IsDirectory, format!("{path}: is a directory"))
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn already_mounted(path: &str) -> Self {
        Self::new(ErrorKind::AlreadyMounted, format!("{path}: already mounted"))
    }

    pub fn no_mount(path: &str) -> Self {
        Self::new(ErrorKind::NotMounted, format!("{path}: no filesystem mounted"))
    }

    pub fn cross_mount_rename(old: &str, new: &str) -> Self {
        Self::new(
            ErrorKind::CrossMountRename,
            format!("{old} -> {new}: rename across mounts is not supported"),
        )
    }

    pub fn unknown_fs_type(fstype: &str) -> Self {
        Self::new(ErrorKind::UnknownFsType, format!("{fstype}: unknown filesystem type"))
    }

    pub fn init_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InitFailed, message)
    }

    pub fn shutdown_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShutdownFailed, message)
    }

    pub fn streaming_unsupported(path: &str) -> Self {
        Self::new(ErrorKind::StreamingUnsupported, format!("{path}: provider does not stream"))
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// Prefix the message with mount context, keeping the kind intact.
    pub fn with_context(mut self, context: &str) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

/// Well-known `meta` keys of [`FileInfo`].
pub const META_PLUGIN_NAME: &str = "plugin_name";
pub const META_TYPE: &str = "type";

/// Well-known `meta.type` values.
pub const TYPE_ROOT: &str = "root";
pub const TYPE_MOUNT_POINT: &str = "mount-point";
pub const TYPE_DIR: &str = "dir";
pub const TYPE_FILE: &str = "file";

/// File metadata.
///
/// `meta` is a flat string map carrying at minimum `plugin_name` and `type`;
/// plugins may add their own keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mtime: i64,
    pub is_dir: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl FileInfo {
    /// Regular file entry with `meta.type = file`.
    pub fn file(name: impl Into<String>, size: i64, mode: u32, mtime: i64) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mtime,
            is_dir: false,
            meta: BTreeMap::from([(META_TYPE.to_owned(), TYPE_FILE.to_owned())]),
        }
    }

    /// Directory entry with `meta.type = dir`.
    pub fn dir(name: impl Into<String>, mode: u32, mtime: i64) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode,
            mtime,
            is_dir: true,
            meta: BTreeMap::from([(META_TYPE.to_owned(), TYPE_DIR.to_owned())]),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta.insert(key.to_owned(), value.into());
        self
    }
}

/// Byte-stream read handle returned by [`FileSystem::open`].
pub type ReadHandle = Box<dyn AsyncRead + Send + Unpin>;

/// Byte-stream write handle returned by [`FileSystem::open_write`].
///
/// Buffered implementations commit on shutdown; callers must drive the
/// handle to shutdown to observe the write.
pub type WriteHandle = Box<dyn AsyncWrite + Send + Unpin>;

/// Monotonic chunked reader produced by the streaming capability.
///
/// No seeking; `None` terminates the stream.
#[async_trait]
pub trait StreamReader: Send {
    async fn next_chunk(&mut self) -> FsResult<Option<Bytes>>;
}

impl std::fmt::Debug for dyn StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn StreamReader")
    }
}

/// Optional capability for backends with true streaming reads (event
/// streams, large objects). Detected dynamically via
/// [`FileSystem::streaming`].
#[async_trait]
pub trait StreamingFileSystem: FileSystem {
    async fn open_stream(&self, path: &str) -> FsResult<Box<dyn StreamReader>>;
}

/// Filesystem provider interface.
///
/// Paths are absolute, normalized, POSIX-style strings rooted at the
/// provider ("/" is the provider root). Implementations own their locking
/// discipline; the mount table adds no ordering between concurrent calls.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Create an empty regular file.
    async fn create(&self, path: &str) -> FsResult<()>;

    /// Create a directory with the given permission bits.
    async fn mkdir(&self, path: &str, perm: u32) -> FsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &str) -> FsResult<()>;

    /// Remove a file or directory recursively.
    async fn remove_all(&self, path: &str) -> FsResult<()>;

    /// Range read. A negative `offset` reads from 0; a negative `size`
    /// reads to the end. The flag is true when the range reached the end
    /// of the file.
    async fn read(&self, path: &str, offset: i64, size: i64) -> FsResult<(Vec<u8>, bool)>;

    /// Whole-file replace, creating the file when absent. Backends may
    /// return an acknowledgement payload (e.g. a generated identifier).
    async fn write(&self, path: &str, data: &[u8]) -> FsResult<Option<Vec<u8>>>;

    /// Enumerate immediate children. Order is unspecified.
    async fn readdir(&self, path: &str) -> FsResult<Vec<FileInfo>>;

    /// Metadata for a single entry.
    async fn stat(&self, path: &str) -> FsResult<FileInfo>;

    /// Move an entry within this provider.
    async fn rename(&self, old: &str, new: &str) -> FsResult<()>;

    /// Change permission bits.
    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;

    /// Open a byte-stream read handle.
    async fn open(&self, path: &str) -> FsResult<ReadHandle>;

    /// Open a byte-stream write handle; contents commit on shutdown.
    async fn open_write(&self, path: &str) -> FsResult<WriteHandle>;

    /// Streaming capability detection; `None` means unsupported.
    fn streaming(&self) -> Option<&dyn StreamingFileSystem> {
        None
    }
}

/// Shared range-read logic used by providers that hold whole files in
/// memory.
pub fn read_range(data: &[u8], offset: i64, size: i64) -> (Vec<u8>, bool) {
    let len = data.len() as i64;
    let start = offset.max(0).min(len);
    let end = if size < 0 { len } else { start.saturating_add(size).min(len) };
    let eof = end >= len;
    (data[start as usize..end as usize].to_vec(), eof)
}

type ChunkFuture = Pin<
    Box<dyn Future<Output = (Box<dyn StreamReader>, FsResult<Option<Bytes>>)> + Send + 'static>,
>;

enum HandleState {
    Idle(Box<dyn StreamReader>),
    Pending(ChunkFuture),
    Done,
}

/// Adapts a [`StreamReader`] into an opaque [`AsyncRead`] handle.
///
/// Retained for clients of the legacy stream-handle surface; the typed
/// [`StreamReader`] is canonical.
pub struct StreamHandle {
    state: HandleState,
    buffer: Bytes,
}

impl StreamHandle {
    pub fn new(reader: Box<dyn StreamReader>) -> Self {
        Self { state: HandleState::Idle(reader), buffer: Bytes::new() }
    }

    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let take = self.buffer.len().min(buf.remaining());
        buf.put_slice(&self.buffer.split_to(take));
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.buffer.is_empty() {
                self.fill(buf);
                return Poll::Ready(Ok(()));
            }
            match std::mem::replace(&mut self.state, HandleState::Done) {
                HandleState::Idle(mut reader) => {
                    self.state = HandleState::Pending(Box::pin(async move {
                        let chunk = reader.next_chunk().await;
                        (reader, chunk)
                    }));
                }
                HandleState::Pending(mut fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.state = HandleState::Pending(fut);
                        return Poll::Pending;
                    }
                    Poll::Ready((reader, Ok(Some(chunk)))) => {
                        self.state = HandleState::Idle(reader);
                        self.buffer = chunk;
                    }
                    Poll::Ready((_, Ok(None))) => return Poll::Ready(Ok(())),
                    Poll::Ready((_, Err(err))) => {
                        return Poll::Ready(Err(std::io::Error::other(err)));
                    }
                },
                HandleState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_reads_clamp_and_flag_eof() {
        let data = b"hello world";

        let (bytes, eof) = read_range(data, 0, -1);
        assert_eq!(bytes, data);
        assert!(eof);

        let (bytes, eof) = read_range(data, 0, 5);
        assert_eq!(bytes, b"hello");
        assert!(!eof);

        let (bytes, eof) = read_range(data, 6, 100);
        assert_eq!(bytes, b"world");
        assert!(eof);

        let (bytes, eof) = read_range(data, -3, 5);
        assert_eq!(bytes, b"hello");
        assert!(!eof);

        let (bytes, eof) = read_range(data, 42, 1);
        assert!(bytes.is_empty());
        assert!(eof);
    }

    #[test]
    fn file_info_json_round_trip_preserves_meta() {
        let info = FileInfo::file("hello.txt", 12, 0o644, 1_700_000_000)
            .with_meta(META_PLUGIN_NAME, "memfs");

        let json = serde_json::to_string(&info).expect("serialize");
        let back: FileInfo = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back, info);
        assert_eq!(back.meta.get(META_TYPE).map(String::as_str), Some(TYPE_FILE));
        assert_eq!(back.meta.get(META_PLUGIN_NAME).map(String::as_str), Some("memfs"));
    }

    #[test]
    fn error_context_keeps_kind() {
        let err = FsError::not_found("/a/b").with_context("/mnt");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.starts_with("/mnt: "));
    }
}
