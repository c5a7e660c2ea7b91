//! `bully-node`: runs one member of a Bully leader-election cluster.
//!
//! Start a 3-node cluster on one machine. Each node reserves one listening
//! port per peer, consecutive from `--lowest-port` in `--peer` order, and each
//! `--peer` entry points at the port that peer reserved for this node.
//!
//! ```bash
//! # node 1 listens on 9100 (for 2) and 9101 (for 3)
//! cargo run --bin bully-node -- --id 1 --lowest-port 9100 \
//!   --peer 2=127.0.0.1:9200,3=127.0.0.1:9300
//!
//! # node 2 listens on 9200 (for 1) and 9201 (for 3)
//! cargo run --bin bully-node -- --id 2 --lowest-port 9200 \
//!   --peer 1=127.0.0.1:9100,3=127.0.0.1:9301
//!
//! # node 3 listens on 9300 (for 1) and 9301 (for 2)
//! cargo run --bin bully-node -- --id 3 --lowest-port 9300 \
//!   --peer 1=127.0.0.1:9101,2=127.0.0.1:9201
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use bully_connection::cli::{shutdown_on_signal, Args};
use bully_connection::BullyConnection;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let node = BullyConnection::with_options(args.cluster(), args.lowest_port, args.id, args.options())
        .await
        .with_context(|| format!("failed to set up node {}", args.id))?;
    let handle = node.handle();

    tokio::spawn(shutdown_on_signal(tokio::signal::ctrl_c(), handle.clone()));

    let mut watcher = handle.clone();
    tokio::spawn(async move {
        while let Some(leader) = watcher.leader_changed().await {
            match leader {
                Some(leader) => info!(leader, "cluster leader"),
                None => info!("no leader known"),
            }
        }
    });

    info!(id = args.id, ports = ?handle.listener_ports(), "node starting");
    node.start()
        .await
        .with_context(|| format!("node {} failed to start", args.id))?;

    Ok(())
}
