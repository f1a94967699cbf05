//! Sandboxed plugin host.
//!
//! Loads untrusted plugin modules compiled to WebAssembly, marshals
//! filesystem calls across the sandbox boundary, and re-exposes the
//! aggregated filesystem to the guest under capability scoping.
//!
//! Guest ABI. A module exports `memory`, `alloc(len) -> ptr`,
//! `dealloc(ptr, len)`, and one entry point per operation, each with the
//! signature `(ptr: u32, len: u32) -> u64`: the arguments address a request
//! buffer in linear memory, the return packs `(ptr << 32) | len` of a
//! response buffer ([`marshal`] describes both). Entry points: `name`,
//! `readme`, `initialize`, `read`, `write`, `stat`, `readdir`, `create`,
//! `mkdir`, `remove`, `remove_all`, `rename`, `chmod`, and optionally
//! `shutdown`. Request layouts per operation:
//!
//! - `initialize`: bytes(config JSON)
//! - `read`: str(path), i64(offset), i64(size); response payload is an eof
//!   byte followed by the data
//! - `write`: str(path), bytes(data); response payload is the backend ack
//! - `mkdir`: str(path), u32(perm); `chmod`: str(path), u32(mode)
//! - `rename`: str(old), str(new)
//! - everything else: str(path)
//!
//! Host imports live under the `agfs_host` module and mirror the same
//! encoding: `host_fs_read`, `host_fs_write`, `host_fs_stat`,
//! `host_fs_readdir`, `host_fs_create`, `host_fs_mkdir`, `host_fs_remove`,
//! `host_fs_remove_all`, `host_fs_rename`. They are only usable when the
//! mount configuration carries `host_prefix`; every guest-supplied path is
//! confined to that prefix. Host callbacks dispatch through the mount
//! table like any other client, so a guest observes only what the host
//! namespace exposes. A callback that routes back into the guest's own
//! mount deadlocks on the per-instance lock; self-referential mounts are
//! unsupported.
//!
//! Instances are single-threaded: a per-instance lock serializes calls,
//! and guest execution runs on the blocking pool so host callbacks can
//! block on the async mount table.

pub mod marshal;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, Trap, TypedFunc};

use crate::mount::MountableFs;
use crate::plugin::{config_str, ConfigMap, Plugin, PluginRegistry};
use crate::vfs::{
    path, FileInfo, FileSystem, FsError, FsResult, ReadHandle, WriteHandle,
};
use marshal::{RequestBuilder, RequestReader};

/// Import module name for host filesystem calls.
const HOST_MODULE: &str = "agfs_host";

/// Fuel granted to every guest call; exhaustion maps to `DeadlineExceeded`.
const CALL_FUEL: u64 = 5_000_000_000;

/// Largest response buffer accepted from a guest (64 MiB).
const MAX_RESPONSE_LEN: usize = 64 * 1024 * 1024;

/// Where plugin module bytes come from.
pub enum ModuleSource {
    Bytes(Vec<u8>),
    /// An AGFS URL (`pfs://<mount>/<path>`) resolved through the mount
    /// table.
    Url(String),
}

/// Translate a `pfs://` URL into a namespace path.
pub fn parse_plugin_url(url: &str) -> FsResult<String> {
    let rest = url
        .strip_prefix("pfs://")
        .ok_or_else(|| FsError::invalid_argument(format!("{url}: not a pfs:// URL")))?;
    if rest.is_empty() {
        return Err(FsError::invalid_argument(format!("{url}: empty plugin URL")));
    }
    path::normalize(&format!("/{rest}"))
}

/// Resolve a module source to raw bytes.
pub async fn fetch_module_bytes(fs: &MountableFs, source: ModuleSource) -> FsResult<Vec<u8>> {
    match source {
        ModuleSource::Bytes(bytes) => Ok(bytes),
        ModuleSource::Url(url) => {
            let module_path = parse_plugin_url(&url)?;
            let (bytes, _) = fs.read(&module_path, 0, -1).await?;
            Ok(bytes)
        }
    }
}

/// Scope a guest-supplied path to the capability prefix.
///
/// Relative paths are joined under the prefix; absolute paths are taken as
/// host namespace references. Either way the resolved path must stay at or
/// below the prefix, so `..` escapes and foreign absolute paths both fail
/// `PermissionDenied`.
pub fn scope_host_path(prefix: &str, guest: &str) -> FsResult<String> {
    let denied = || FsError::permission_denied(format!("{guest}: escapes the host prefix"));
    let prefix = path::normalize(prefix).map_err(|_| denied())?;
    let resolved = if guest.starts_with('/') {
        path::normalize(guest).map_err(|_| denied())?
    } else {
        path::join(&prefix, guest).map_err(|_| denied())?
    };
    if resolved == prefix || prefix == "/" || path::is_under(&prefix, &resolved) {
        Ok(resolved)
    } else {
        Err(denied())
    }
}

/// Capability grant carried by a sandbox instance.
#[derive(Clone)]
struct HostScope {
    fs: Arc<MountableFs>,
    prefix: String,
    handle: Handle,
}

/// Per-store state visible to host imports.
struct HostState {
    scope: Option<HostScope>,
}

#[derive(Clone, Copy)]
enum HostOp {
    Read,
    Write,
    Stat,
    Readdir,
    Create,
    Mkdir,
    Remove,
    RemoveAll,
    Rename,
}

const HOST_IMPORTS: [(&str, HostOp); 9] = [
    ("host_fs_read", HostOp::Read),
    ("host_fs_write", HostOp::Write),
    ("host_fs_stat", HostOp::Stat),
    ("host_fs_readdir", HostOp::Readdir),
    ("host_fs_create", HostOp::Create),
    ("host_fs_mkdir", HostOp::Mkdir),
    ("host_fs_remove", HostOp::Remove),
    ("host_fs_remove_all", HostOp::RemoveAll),
    ("host_fs_rename", HostOp::Rename),
];

fn link_host_imports(linker: &mut Linker<HostState>) -> FsResult<()> {
    for (name, op) in HOST_IMPORTS {
        linker
            .func_wrap(
                HOST_MODULE,
                name,
                move |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u64 {
                    host_call(&mut caller, ptr, len, op)
                },
            )
            .map_err(|err| FsError::other(format!("linking {name}: {err}")))?;
    }
    Ok(())
}

/// Entry point of every host import: decode, dispatch, encode. Never
/// traps; 0 signals that no response buffer could be produced.
fn host_call(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32, op: HostOp) -> u64 {
    let response = match host_call_inner(caller, ptr, len, op) {
        Ok(payload) => marshal::ok_response(&payload),
        Err(err) => marshal::err_response(&err),
    };
    write_guest_buffer(caller, &response).unwrap_or(0)
}

fn host_call_inner(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    len: u32,
    op: HostOp,
) -> FsResult<Vec<u8>> {
    let request = read_guest_buffer(caller, ptr, len)?;
    let scope = caller.data().scope.clone().ok_or_else(|| {
        FsError::permission_denied("host filesystem access is not granted to this plugin")
    })?;
    let mut reader = RequestReader::new(&request);
    // The guest runs on the blocking pool, so blocking on the async mount
    // table here is safe; the table lock is never held across this call.
    match op {
        HostOp::Read => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            let offset = reader.i64()?;
            let size = reader.i64()?;
            let (data, eof) = scope.handle.block_on(scope.fs.read(&target, offset, size))?;
            Ok(marshal::encode_read_payload(&data, eof))
        }
        HostOp::Write => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            let data = reader.bytes()?;
            let ack = scope.handle.block_on(scope.fs.write(&target, &data))?;
            Ok(ack.unwrap_or_default())
        }
        HostOp::Stat => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            let info = scope.handle.block_on(scope.fs.stat(&target))?;
            serde_json::to_vec(&info)
                .map_err(|err| FsError::other(format!("encoding stat result: {err}")))
        }
        HostOp::Readdir => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            let entries = scope.handle.block_on(scope.fs.readdir(&target))?;
            serde_json::to_vec(&entries)
                .map_err(|err| FsError::other(format!("encoding readdir result: {err}")))
        }
        HostOp::Create => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            scope.handle.block_on(scope.fs.create(&target))?;
            Ok(Vec::new())
        }
        HostOp::Mkdir => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            let perm = reader.u32()?;
            scope.handle.block_on(scope.fs.mkdir(&target, perm))?;
            Ok(Vec::new())
        }
        HostOp::Remove => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            scope.handle.block_on(scope.fs.remove(&target))?;
            Ok(Vec::new())
        }
        HostOp::RemoveAll => {
            let target = scope_host_path(&scope.prefix, &reader.str()?)?;
            scope.handle.block_on(scope.fs.remove_all(&target))?;
            Ok(Vec::new())
        }
        HostOp::Rename => {
            let old = scope_host_path(&scope.prefix, &reader.str()?)?;
            let new = scope_host_path(&scope.prefix, &reader.str()?)?;
            scope.handle.block_on(scope.fs.rename(&old, &new))?;
            Ok(Vec::new())
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> FsResult<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(FsError::other("guest exports no linear memory")),
    }
}

fn read_guest_buffer(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    len: u32,
) -> FsResult<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buf)
        .map_err(|err| FsError::invalid_argument(format!("guest buffer out of bounds: {err}")))?;
    Ok(buf)
}

/// Place a response buffer into guest memory via the guest allocator and
/// return the packed `(ptr << 32) | len`.
fn write_guest_buffer(caller: &mut Caller<'_, HostState>, data: &[u8]) -> FsResult<u64> {
    let alloc = match caller.get_export("alloc") {
        Some(Extern::Func(func)) => func
            .typed::<u32, u32>(&*caller)
            .map_err(|err| FsError::other(format!("guest alloc has a bad signature: {err}")))?,
        _ => return Err(FsError::other("guest exports no alloc")),
    };
    let ptr = alloc
        .call(&mut *caller, data.len() as u32)
        .map_err(|err| FsError::other(format!("guest alloc trapped: {err}")))?;
    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, ptr as usize, data)
        .map_err(|err| FsError::other(format!("guest memory write: {err}")))?;
    Ok(((ptr as u64) << 32) | data.len() as u64)
}

fn map_guest_error(err: wasmtime::Error, export: &str) -> FsError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            FsError::deadline_exceeded(format!("guest `{export}` exceeded its call budget"))
        }
        _ => FsError::other(format!("guest `{export}` trapped: {err}")),
    }
}

/// One instantiated module: store, instance, memory, and the temporary
/// file holding the module bytes. Dropping the instance deletes the file.
struct SandboxInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    _module_file: NamedTempFile,
}

impl SandboxInstance {
    /// Materialize the module to a temporary file, compile, instantiate,
    /// and run the guest's `initialize`. Any failure tears everything
    /// down, including the temporary file.
    fn instantiate(
        bytes: &[u8],
        scope: Option<HostScope>,
        config_json: &[u8],
    ) -> FsResult<Self> {
        let module_file = NamedTempFile::new()
            .map_err(|err| FsError::other(format!("creating module temp file: {err}")))?;
        std::fs::write(module_file.path(), bytes)
            .map_err(|err| FsError::other(format!("writing module temp file: {err}")))?;

        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|err| FsError::other(format!("wasm engine: {err}")))?;
        let module = Module::from_file(&engine, module_file.path())
            .map_err(|err| FsError::init_failed(format!("module does not compile: {err}")))?;

        let mut store = Store::new(&engine, HostState { scope });
        let mut linker = Linker::new(&engine);
        link_host_imports(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|err| FsError::init_failed(format!("module does not instantiate: {err}")))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| FsError::init_failed("module exports no linear memory"))?;

        let mut sandbox = Self { store, instance, memory, _module_file: module_file };
        let request = RequestBuilder::new().bytes(config_json).finish();
        sandbox.call("initialize", &request)?;
        Ok(sandbox)
    }

    /// Invoke a guest entry point under the per-call fuel budget.
    fn call(&mut self, export: &str, request: &[u8]) -> FsResult<Vec<u8>> {
        let func = self
            .instance
            .get_typed_func::<(u32, u32), u64>(&mut self.store, export)
            .map_err(|_| FsError::other(format!("guest does not export `{export}`")))?;
        self.invoke(func, export, request)
    }

    /// Like [`Self::call`] but a missing export is not an error.
    fn call_optional(&mut self, export: &str, request: &[u8]) -> FsResult<Option<Vec<u8>>> {
        match self.instance.get_typed_func::<(u32, u32), u64>(&mut self.store, export) {
            Ok(func) => self.invoke(func, export, request).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn invoke(
        &mut self,
        func: TypedFunc<(u32, u32), u64>,
        export: &str,
        request: &[u8],
    ) -> FsResult<Vec<u8>> {
        self.store
            .set_fuel(CALL_FUEL)
            .map_err(|err| FsError::other(format!("setting fuel: {err}")))?;
        let ptr = self.copy_in(request)?;
        let packed = func
            .call(&mut self.store, (ptr, request.len() as u32))
            .map_err(|err| map_guest_error(err, export))?;
        if packed == 0 {
            return Err(FsError::other(format!("guest `{export}` returned no response")));
        }
        let response = self.copy_out(packed)?;
        marshal::decode_response(&response)
    }

    fn copy_in(&mut self, data: &[u8]) -> FsResult<u32> {
        let alloc = self
            .instance
            .get_typed_func::<u32, u32>(&mut self.store, "alloc")
            .map_err(|_| FsError::other("guest does not export `alloc`"))?;
        let ptr = alloc
            .call(&mut self.store, data.len() as u32)
            .map_err(|err| map_guest_error(err, "alloc"))?;
        self.memory
            .write(&mut self.store, ptr as usize, data)
            .map_err(|err| FsError::other(format!("guest memory write: {err}")))?;
        Ok(ptr)
    }

    fn copy_out(&mut self, packed: u64) -> FsResult<Vec<u8>> {
        let ptr = (packed >> 32) as usize;
        let len = (packed & 0xffff_ffff) as usize;
        if len > MAX_RESPONSE_LEN {
            return Err(FsError::other("guest response exceeds the size limit"));
        }
        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, ptr, &mut buf)
            .map_err(|err| FsError::other(format!("guest memory read: {err}")))?;
        // Hand the response buffer back to the guest allocator.
        if let Ok(dealloc) =
            self.instance.get_typed_func::<(u32, u32), ()>(&mut self.store, "dealloc")
        {
            let _ = dealloc.call(&mut self.store, (ptr as u32, len as u32));
        }
        Ok(buf)
    }

    fn call_text(&mut self, export: &str) -> FsResult<String> {
        let payload = self.call(export, &[])?;
        String::from_utf8(payload)
            .map_err(|_| FsError::other(format!("guest `{export}` returned invalid UTF-8")))
    }
}

/// Run a guest operation on the blocking pool under the instance lock.
async fn run_guest<T, F>(inner: Arc<Mutex<SandboxInstance>>, op: F) -> FsResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut SandboxInstance) -> FsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut sandbox = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&mut sandbox)
    })
    .await
    .map_err(|err| FsError::other(format!("sandbox worker failed: {err}")))?
}

/// Provider facade over one sandbox instance.
pub struct WasmFs {
    inner: Arc<Mutex<SandboxInstance>>,
}

impl WasmFs {
    async fn simple(&self, export: &'static str, request: Vec<u8>) -> FsResult<Vec<u8>> {
        run_guest(self.inner.clone(), move |sandbox| sandbox.call(export, &request)).await
    }
}

#[async_trait]
impl FileSystem for WasmFs {
    async fn create(&self, raw: &str) -> FsResult<()> {
        let request = RequestBuilder::new().str(raw).finish();
        self.simple("create", request).await.map(drop)
    }

    async fn mkdir(&self, raw: &str, perm: u32) -> FsResult<()> {
        let request = RequestBuilder::new().str(raw).u32(perm).finish();
        self.simple("mkdir", request).await.map(drop)
    }

    async fn remove(&self, raw: &str) -> FsResult<()> {
        let request = RequestBuilder::new().str(raw).finish();
        self.simple("remove", request).await.map(drop)
    }

    async fn remove_all(&self, raw: &str) -> FsResult<()> {
        let request = RequestBuilder::new().str(raw).finish();
        self.simple("remove_all", request).await.map(drop)
    }

    async fn read(&self, raw: &str, offset: i64, size: i64) -> FsResult<(Vec<u8>, bool)> {
        let request = RequestBuilder::new().str(raw).i64(offset).i64(size).finish();
        let payload = self.simple("read", request).await?;
        marshal::decode_read_payload(&payload)
    }

    async fn write(&self, raw: &str, data: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let request = RequestBuilder::new().str(raw).bytes(data).finish();
        let ack = self.simple("write", request).await?;
        Ok(if ack.is_empty() { None } else { Some(ack) })
    }

    async fn readdir(&self, raw: &str) -> FsResult<Vec<FileInfo>> {
        let request = RequestBuilder::new().str(raw).finish();
        let payload = self.simple("readdir", request).await?;
        serde_json::from_slice(&payload)
            .map_err(|err| FsError::other(format!("guest readdir payload: {err}")))
    }

    async fn stat(&self, raw: &str) -> FsResult<FileInfo> {
        let request = RequestBuilder::new().str(raw).finish();
        let payload = self.simple("stat", request).await?;
        serde_json::from_slice(&payload)
            .map_err(|err| FsError::other(format!("guest stat payload: {err}")))
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let request = RequestBuilder::new().str(old).str(new).finish();
        self.simple("rename", request).await.map(drop)
    }

    async fn chmod(&self, raw: &str, mode: u32) -> FsResult<()> {
        let request = RequestBuilder::new().str(raw).u32(mode).finish();
        self.simple("chmod", request).await.map(drop)
    }

    async fn open(&self, raw: &str) -> FsResult<ReadHandle> {
        let (data, _) = self.read(raw, 0, -1).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn open_write(&self, raw: &str) -> FsResult<WriteHandle> {
        Ok(Box::new(WasmWriter {
            inner: self.inner.clone(),
            path: raw.to_owned(),
            buffer: Vec::new(),
            commit: None,
        }))
    }
}

type CommitFuture = Pin<Box<dyn Future<Output = FsResult<()>> + Send + 'static>>;

/// Buffering write handle committing through the guest `write` on
/// shutdown.
struct WasmWriter {
    inner: Arc<Mutex<SandboxInstance>>,
    path: String,
    buffer: Vec<u8>,
    commit: Option<CommitFuture>,
}

impl AsyncWrite for WasmWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.as_mut().get_mut();
        let commit = this.commit.get_or_insert_with(|| {
            let inner = this.inner.clone();
            let path = std::mem::take(&mut this.path);
            let data = std::mem::take(&mut this.buffer);
            Box::pin(async move {
                let request = RequestBuilder::new().str(&path).bytes(&data).finish();
                run_guest(inner, move |sandbox| sandbox.call("write", &request)).await.map(drop)
            })
        });
        commit.as_mut().poll(cx).map_err(std::io::Error::other)
    }
}

/// A dynamically loaded plugin: module bytes plus per-mount sandbox state.
pub struct WasmPlugin {
    name: String,
    module_bytes: Arc<Vec<u8>>,
    host: Arc<MountableFs>,
    fs: Option<Arc<WasmFs>>,
    readme: String,
}

impl WasmPlugin {
    fn new(name: String, module_bytes: Arc<Vec<u8>>, host: Arc<MountableFs>) -> Self {
        Self { name, module_bytes, host, fs: None, readme: String::new() }
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &ConfigMap) -> FsResult<()> {
        let scope = match config_str(config, "host_prefix") {
            Some(prefix) => Some(HostScope {
                fs: self.host.clone(),
                prefix: path::normalize(prefix)?,
                handle: Handle::current(),
            }),
            None => None,
        };
        let config_json = serde_json::to_vec(config)
            .map_err(|err| FsError::invalid_config(format!("encoding plugin config: {err}")))?;
        let bytes = self.module_bytes.clone();
        let mut instance =
            tokio::task::spawn_blocking(move || {
                SandboxInstance::instantiate(&bytes, scope, &config_json)
            })
            .await
            .map_err(|err| FsError::other(format!("sandbox worker failed: {err}")))??;

        let guest_name = instance.call_text("name")?;
        self.readme = instance.call_text("readme")?;
        debug!(plugin = %self.name, guest = %guest_name, "sandboxed plugin initialized");
        self.fs = Some(Arc::new(WasmFs { inner: Arc::new(Mutex::new(instance)) }));
        Ok(())
    }

    fn filesystem(&self) -> FsResult<Arc<dyn FileSystem>> {
        match &self.fs {
            Some(fs) => Ok(fs.clone()),
            None => Err(FsError::other("sandboxed plugin is not initialized")),
        }
    }

    fn readme(&self) -> String {
        self.readme.clone()
    }

    async fn shutdown(&self) -> FsResult<()> {
        if let Some(fs) = &self.fs {
            let inner = fs.inner.clone();
            let result = run_guest(inner, |sandbox| sandbox.call_optional("shutdown", &[])).await;
            match result {
                Ok(_) => {}
                Err(err) => {
                    // The instance is torn down regardless; a trapped
                    // shutdown is not worth keeping the mount alive for.
                    warn!(plugin = %self.name, error = %err, "guest shutdown failed");
                }
            }
        }
        Ok(())
    }
}

/// Fetch a module, verify it compiles, and register a factory that
/// instantiates a fresh sandbox per mount.
pub async fn load(
    fs: &Arc<MountableFs>,
    registry: &Arc<PluginRegistry>,
    name: &str,
    source: ModuleSource,
) -> FsResult<()> {
    let bytes = Arc::new(fetch_module_bytes(fs, source).await?);
    {
        let bytes = bytes.clone();
        tokio::task::spawn_blocking(move || compile_check(&bytes))
            .await
            .map_err(|err| FsError::other(format!("sandbox worker failed: {err}")))??;
    }
    let plugin_name = name.to_owned();
    let host = fs.clone();
    registry.register(
        name,
        Box::new(move || {
            Box::new(WasmPlugin::new(plugin_name.clone(), bytes.clone(), host.clone()))
        }),
    );
    info!(name, "sandboxed plugin registered");
    Ok(())
}

fn compile_check(bytes: &[u8]) -> FsResult<()> {
    let mut config = Config::new();
    config.consume_fuel(true);
    let engine =
        Engine::new(&config).map_err(|err| FsError::other(format!("wasm engine: {err}")))?;
    Module::new(&engine, bytes)
        .map(drop)
        .map_err(|err| FsError::init_failed(format!("module does not compile: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;

    #[test]
    fn host_paths_are_confined_to_the_prefix() {
        assert_eq!(scope_host_path("/srv", "data/x.txt").unwrap(), "/srv/data/x.txt");
        assert_eq!(scope_host_path("/srv", "/srv/data").unwrap(), "/srv/data");
        assert_eq!(scope_host_path("/srv", "/srv").unwrap(), "/srv");
        assert_eq!(scope_host_path("/", "/anything").unwrap(), "/anything");

        for guest in ["/etc/passwd", "../etc/passwd", "a/../../etc", "/srvother"] {
            let err = scope_host_path("/srv", guest).expect_err("must deny");
            assert_eq!(err.kind, ErrorKind::PermissionDenied, "guest path {guest}");
        }
    }

    #[test]
    fn plugin_urls_parse_into_namespace_paths() {
        assert_eq!(parse_plugin_url("pfs://plugins/hello.wasm").unwrap(), "/plugins/hello.wasm");
        assert_eq!(parse_plugin_url("pfs://m/a/b").unwrap(), "/m/a/b");

        assert!(parse_plugin_url("http://x/y").is_err());
        assert!(parse_plugin_url("pfs://").is_err());
    }

    #[tokio::test]
    async fn loading_a_malformed_module_fails() {
        let registry = Arc::new(PluginRegistry::builtin());
        let fs = Arc::new(MountableFs::new(registry.clone()));
        let err = load(&fs, &registry, "bogus", ModuleSource::Bytes(vec![0, 1, 2, 3]))
            .await
            .expect_err("not a wasm module");
        assert_eq!(err.kind, ErrorKind::InitFailed);
        assert!(!registry.contains("bogus"));
    }

    #[tokio::test]
    async fn url_sources_resolve_through_the_mount_table() {
        let registry = Arc::new(PluginRegistry::builtin());
        let fs = Arc::new(MountableFs::new(registry.clone()));
        fs.mount("memfs", "/plugins", &ConfigMap::new()).await.expect("mount");
        fs.write("/plugins/mod.wasm", b"\0asm....").await.expect("write");

        let bytes =
            fetch_module_bytes(&fs, ModuleSource::Url("pfs://plugins/mod.wasm".into()))
                .await
                .expect("fetch");
        assert_eq!(bytes, b"\0asm....");

        let err = fetch_module_bytes(&fs, ModuleSource::Url("pfs://plugins/none".into()))
            .await
            .expect_err("missing blob");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
