//! Mount table behavior through the public surface.

use std::sync::Arc;

use agfs::plugin::ConfigMap;
use agfs::vfs::{
    ErrorKind, FileSystem, StreamingFileSystem, META_TYPE, TYPE_MOUNT_POINT, TYPE_ROOT,
};
use agfs::{MountableFs, PluginRegistry};
use tokio::io::AsyncReadExt;

fn table() -> Arc<MountableFs> {
    Arc::new(MountableFs::new(Arc::new(PluginRegistry::builtin())))
}

async fn mount_memfs(fs: &MountableFs, at: &str) {
    fs.mount("memfs", at, &ConfigMap::new()).await.expect("mount memfs");
}

#[tokio::test]
async fn memfs_round_trip_and_root_listing() {
    let fs = table();
    mount_memfs(&fs, "/m").await;

    fs.write("/m/hello", b"hi").await.expect("write");
    let (data, eof) = fs.read("/m/hello", 0, -1).await.expect("read");
    assert_eq!(data, b"hi");
    assert!(eof);

    let entries = fs.readdir("/").await.expect("readdir");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "m");
    assert!(entries[0].is_dir);
    assert_eq!(entries[0].meta.get(META_TYPE).map(String::as_str), Some(TYPE_MOUNT_POINT));
}

#[tokio::test]
async fn virtual_ancestors_are_browsable() {
    let fs = table();
    mount_memfs(&fs, "/a/b").await;
    mount_memfs(&fs, "/a/c").await;

    let entries = fs.readdir("/").await.expect("readdir root");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a");

    let mut names: Vec<String> =
        fs.readdir("/a").await.expect("readdir /a").into_iter().map(|e| e.name).collect();
    names.sort_unstable();
    assert_eq!(names, ["b", "c"]);

    let info = fs.stat("/a").await.expect("stat /a");
    assert!(info.is_dir);
    assert_eq!(info.meta.get(META_TYPE).map(String::as_str), Some(TYPE_MOUNT_POINT));

    let err = fs.stat("/a/x").await.expect_err("no entry");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn root_stat_is_synthesized() {
    let fs = table();
    let info = fs.stat("/").await.expect("stat root");
    assert_eq!(info.name, "/");
    assert!(info.is_dir);
    assert_eq!(info.mode, 0o755);
    assert_eq!(info.meta.get(META_TYPE).map(String::as_str), Some(TYPE_ROOT));
}

#[tokio::test]
async fn cross_mount_rename_precedence() {
    let fs = table();
    mount_memfs(&fs, "/x").await;
    fs.write("/x/f", b"payload").await.expect("write");

    // Source resolves, destination does not: cross-mount rename.
    let err = fs.rename("/x/f", "/y/f").await.expect_err("cross mount");
    assert_eq!(err.kind, ErrorKind::CrossMountRename);

    // Source resolves, destination lands in a different mount: same error.
    mount_memfs(&fs, "/y").await;
    let err = fs.rename("/x/f", "/y/f").await.expect_err("different mounts");
    assert_eq!(err.kind, ErrorKind::CrossMountRename);

    // Unresolved source: the missing mount wins.
    let err = fs.rename("/z/f", "/x/g").await.expect_err("no source mount");
    assert_eq!(err.kind, ErrorKind::NotMounted);

    // Both sides unchanged.
    assert_eq!(fs.read("/x/f", 0, -1).await.expect("read").0, b"payload");
    let err = fs.stat("/y/f").await.expect_err("destination untouched");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn unmount_restores_the_previous_state() {
    let fs = table();
    assert!(fs.readdir("/").await.expect("empty root").is_empty());

    mount_memfs(&fs, "/m").await;
    fs.write("/m/f", b"x").await.expect("write");
    fs.unmount("/m").await.expect("unmount");

    assert!(fs.readdir("/").await.expect("root again").is_empty());
    assert!(fs.mounts().await.is_empty());
    let err = fs.read("/m/f", 0, -1).await.expect_err("gone");
    assert_eq!(err.kind, ErrorKind::NotMounted);
}

#[tokio::test]
async fn root_listing_deduplicates_first_components() {
    let fs = table();
    mount_memfs(&fs, "/sqlfs/tidb").await;
    mount_memfs(&fs, "/sqlfs/sqlite").await;
    mount_memfs(&fs, "/queue").await;

    let names: Vec<String> =
        fs.readdir("/").await.expect("readdir").into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["queue", "sqlfs"]);

    let mut names: Vec<String> =
        fs.readdir("/sqlfs").await.expect("readdir").into_iter().map(|e| e.name).collect();
    names.sort_unstable();
    assert_eq!(names, ["sqlite", "tidb"]);

    // The mount root takes the mount's final path component as its name.
    let info = fs.stat("/sqlfs/tidb").await.expect("stat");
    assert_eq!(info.name, "tidb");
}

#[tokio::test]
async fn operations_outside_any_mount_are_rejected() {
    let fs = table();
    mount_memfs(&fs, "/m").await;

    let err = fs.readdir("/nowhere").await.expect_err("no mount");
    assert_eq!(err.kind, ErrorKind::NotMounted);
    let err = fs.write("/nowhere/f", b"x").await.expect_err("no mount");
    assert_eq!(err.kind, ErrorKind::NotMounted);
}

#[tokio::test]
async fn streaming_is_capability_detected() {
    let fs = table();
    mount_memfs(&fs, "/m").await;
    let blob = vec![3u8; 200_000];
    fs.write("/m/blob", &blob).await.expect("write");

    let mut stream = fs.open_stream("/m/blob").await.expect("open_stream");
    let mut total = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.expect("chunk") {
        total.extend_from_slice(&chunk);
    }
    assert_eq!(total, blob);
}

#[tokio::test]
async fn streaming_fallback_for_non_streaming_providers() {
    let fs = table();
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut config = ConfigMap::new();
    config.insert(
        "local_dir".into(),
        serde_json::Value::String(dir.path().to_string_lossy().into_owned()),
    );
    fs.mount("localfs", "/l", &config).await.expect("mount localfs");

    let err = fs.open_stream("/l/f").await.expect_err("no capability");
    assert_eq!(err.kind, ErrorKind::StreamingUnsupported);
}

#[tokio::test]
#[allow(deprecated)]
async fn legacy_stream_handle_reads_everything() {
    let fs = table();
    mount_memfs(&fs, "/m").await;
    fs.write("/m/f", b"stream me").await.expect("write");

    let mut handle = fs.open_stream_handle("/m/f").await.expect("handle");
    let mut out = Vec::new();
    handle.read_to_end(&mut out).await.expect("read");
    assert_eq!(out, b"stream me");
}
