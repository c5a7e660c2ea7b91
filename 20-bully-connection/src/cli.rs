use std::future::Future;
use std::io;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{ClusterConfig, NodeOptions, PeerEntry};
use crate::coordinator::NodeHandle;
use crate::envelope::HostId;
use crate::retry::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run one node of a Bully leader-election cluster")]
pub struct Args {
    /// Numeric id of this node; higher ids win elections.
    #[arg(long)]
    pub id: HostId,

    /// First of the consecutive ports this node listens on, one per peer in
    /// --peer order.
    #[arg(long)]
    pub lowest_port: u16,

    /// Peer map: id=host:port,... where host:port is the listener that peer
    /// reserved for this node. Must not include this node.
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<PeerEntry>,

    /// Minimum spacing between replica steps, in milliseconds.
    #[arg(long, default_value_t = 3_000)]
    pub tick_ms: u64,

    /// Connect and reply timeout on peer links, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    pub socket_timeout_ms: u64,

    /// Attempts made to reach peers during the startup broadcast.
    #[arg(long, default_value_t = 6)]
    pub startup_attempts: u32,
}

impl Args {
    pub fn cluster(&self) -> ClusterConfig {
        self.peer.iter().cloned().collect()
    }

    pub fn options(&self) -> NodeOptions {
        NodeOptions {
            tick_interval: Duration::from_millis(self.tick_ms),
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            startup_retry: RetryPolicy {
                max_attempts: self.startup_attempts,
                ..RetryPolicy::default()
            },
            ..NodeOptions::default()
        }
    }
}

/// Stops `node` once `signal` fires. If the signal cannot be installed the
/// node keeps running.
pub async fn shutdown_on_signal<F>(signal: F, node: NodeHandle)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(err) = signal.await {
        warn!(error = ?err, "failed to install shutdown signal handler");
        return;
    }
    info!("shutting down");
    node.shutdown();
}
