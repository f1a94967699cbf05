use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agfs::config::Config;
use agfs::{MountableFs, PluginRegistry};

#[derive(Parser)]
#[command(name = "agfs", about = "Aggregated plugin filesystem server")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "agfs.yaml")]
    config: PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(long)]
    address: Option<String>,

    /// Log level, overriding the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    /// Exit instead of continuing when a startup mount fails.
    #[arg(long)]
    fail_fast: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?
    } else {
        Config::default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = Arc::new(PluginRegistry::builtin());
    let fs = Arc::new(MountableFs::new(registry));

    let fail_fast = args.fail_fast || config.server.fail_fast;
    for (fstype, section) in &config.plugins {
        for instance in section.instances() {
            if !instance.enabled {
                continue;
            }
            let label = instance.name.as_deref().unwrap_or(fstype);
            match fs.mount(fstype, &instance.path, &instance.config).await {
                Ok(()) => {}
                Err(err) if fail_fast => {
                    bail!("mounting {label} at {}: {err}", instance.path);
                }
                Err(err) => {
                    error!(plugin = label, path = %instance.path, error = %err, "skipping mount");
                }
            }
        }
    }

    let address = args.address.as_deref().unwrap_or(&config.server.address);
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "agfs listening");

    agfs::handle_forever(listener, fs).await?;
    Ok(())
}
