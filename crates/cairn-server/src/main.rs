//! cairnd — the Cairn node daemon.

use std::path::PathBuf;

use anyhow::Context;
use cairn_config::ConfigLoader;
use cairn_server::Daemon;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairnd", about = "Cairn distributed object store node", version)]
struct Args {
    /// Path to cairn.toml; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the node role (proxy | target).
    #[arg(long)]
    role: Option<String>,

    /// Override the primary URL to join.
    #[arg(long)]
    join: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut cfg = loader.load().context("loading configuration")?;
    if let Some(role) = args.role {
        cfg.node.role = role;
    }
    if let Some(join) = args.join {
        cfg.node.join_url = join;
    }
    cfg.validate().context("validating configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.verbosity.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let daemon = Daemon::new(cfg)?;
    daemon.run().await
}
