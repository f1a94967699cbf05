//! AGFS - an aggregated, plugin-backed filesystem server in Rust.
//!
//! Every subtree of one hierarchical namespace is served by a plugin - an
//! in-memory store, a host directory, a sandboxed WebAssembly module - all
//! behind the same file abstraction. The mount table composes them; the
//! HTTP surface exposes the whole namespace over a uniform RESTful API.

pub mod config;
pub mod mount;
pub mod plugin;
pub mod sandbox;
pub mod server;
pub mod vfs;

use std::sync::Arc;

use tokio::net::TcpListener;

pub use mount::MountableFs;
pub use plugin::PluginRegistry;

/// Starts the server and processes client connections.
pub async fn handle_forever(listener: TcpListener, fs: Arc<MountableFs>) -> std::io::Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;

        socket.set_nodelay(true)?;

        server::serve_connection(socket, fs.clone());
    }
}
