//! Dynamic localfs mounts against a host directory.

use std::sync::Arc;

use agfs::plugin::ConfigMap;
use agfs::vfs::{ErrorKind, FileSystem};
use agfs::{MountableFs, PluginRegistry};
use tempfile::TempDir;

fn local_config(dir: &TempDir) -> ConfigMap {
    let mut config = ConfigMap::new();
    config.insert(
        "local_dir".into(),
        serde_json::Value::String(dir.path().to_string_lossy().into_owned()),
    );
    config
}

#[tokio::test]
async fn dynamic_mount_writes_through_and_survives_unmount() {
    let fs = Arc::new(MountableFs::new(Arc::new(PluginRegistry::builtin())));
    let dir = TempDir::new().expect("tempdir");

    fs.mount("localfs", "/l", &local_config(&dir)).await.expect("mount");

    fs.write("/l/a/b.txt", b"persisted").await.expect("write");
    let host_path = dir.path().join("a/b.txt");
    assert_eq!(std::fs::read(&host_path).expect("host file"), b"persisted");

    fs.unmount("/l").await.expect("unmount");

    // The host file outlives the mount; the namespace path does not.
    assert!(host_path.exists());
    let err = fs.read("/l/a/b.txt", 0, -1).await.expect_err("unmounted");
    assert_eq!(err.kind, ErrorKind::NotMounted);
}

#[tokio::test]
async fn remount_at_the_same_path_sees_prior_contents() {
    let fs = Arc::new(MountableFs::new(Arc::new(PluginRegistry::builtin())));
    let dir = TempDir::new().expect("tempdir");

    fs.mount("localfs", "/l", &local_config(&dir)).await.expect("mount");
    fs.write("/l/keep.txt", b"kept").await.expect("write");
    fs.unmount("/l").await.expect("unmount");

    fs.mount("localfs", "/l", &local_config(&dir)).await.expect("remount");
    let (data, _) = fs.read("/l/keep.txt", 0, -1).await.expect("read");
    assert_eq!(data, b"kept");
}

#[tokio::test]
async fn invalid_config_aborts_the_mount() {
    let fs = Arc::new(MountableFs::new(Arc::new(PluginRegistry::builtin())));

    let err = fs.mount("localfs", "/l", &ConfigMap::new()).await.expect_err("missing key");
    assert_eq!(err.kind, ErrorKind::InvalidConfig);
    assert!(fs.mounts().await.is_empty());

    let err = fs.mount("nofs", "/l", &ConfigMap::new()).await.expect_err("unknown type");
    assert_eq!(err.kind, ErrorKind::UnknownFsType);
}
