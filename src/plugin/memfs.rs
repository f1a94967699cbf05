//! Pure in-memory backend.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ConfigMap, Plugin};
use crate::vfs::memory::MemTree;
use crate::vfs::{FileSystem, FsResult};

const README: &str = "\
memfs: an in-memory filesystem.

Contents live in process memory and vanish on unmount. No configuration
keys are recognized.
";

/// In-memory plugin backed by [`MemTree`].
pub struct MemfsPlugin {
    fs: Arc<MemTree>,
}

impl MemfsPlugin {
    pub fn new() -> Self {
        Self { fs: Arc::new(MemTree::new("memfs")) }
    }
}

impl Default for MemfsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for MemfsPlugin {
    fn name(&self) -> &str {
        "memfs"
    }

    async fn initialize(&mut self, _config: &ConfigMap) -> FsResult<()> {
        Ok(())
    }

    fn filesystem(&self) -> FsResult<Arc<dyn FileSystem>> {
        Ok(self.fs.clone())
    }

    fn readme(&self) -> String {
        README.to_owned()
    }

    async fn shutdown(&self) -> FsResult<()> {
        Ok(())
    }
}
