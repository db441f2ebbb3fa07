//! shardircd — one cluster node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use shardirc::config::{Config, Overrides};
use shardirc::server::{self, Node};
use shardirc::MemoryBus;

#[derive(Debug, Parser)]
#[command(name = "shardircd", about = "Horizontally shardable IRC server node")]
struct Args {
    /// YAML config file; explicit flags below override its keys.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Realm identity, server name in replies, and node id on the bus.
    #[arg(long)]
    hostname: Option<String>,

    /// IRC listen port.
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path shared by every node of the cluster.
    #[arg(long)]
    db: Option<String>,

    /// Admit unknown nicks on login instead of rejecting them.
    #[arg(long)]
    user_on_request: Option<bool>,

    /// Let JOIN create channels unknown to the cluster.
    #[arg(long)]
    group_on_request: Option<bool>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            hostname: self.hostname.clone(),
            port: self.port,
            db: self.db.clone(),
            user_on_request: self.user_on_request,
            group_on_request: self.group_on_request,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::resolve(args.config.as_deref(), &args.overrides())
        .context("resolving configuration")?;
    info!("starting {} on port {}", config.hostname, config.port);

    let bus = Arc::new(MemoryBus::new());
    let node = Node::connect(config, bus).await.context("connecting document store")?;

    tokio::select! {
        res = server::serve(Arc::clone(&node)) => res.context("listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }

    node.shutdown().await;
    Ok(())
}
