//! Connection and coordination layer for a Bully leader-election cluster.
//!
//! A fixed set of numbered peers agree on a single leader over point-to-point
//! TCP links. Each node keeps, per peer:
//!
//! - one outbound connection used for its own requests, and
//! - one listening port, reserved for that peer, served by a supervised task.
//!
//! Messages travel in a two-layer [`Envelope`]: the `CONNECTION` layer
//! carries liveness probes and ACKs and is answered by the listener itself;
//! the `BULLY` layer carries election traffic and is relayed to the
//! coordinator, which owns the election state machine.
//!
//! # Modules
//!
//! - [`envelope`]: wire envelope and newline-delimited JSON framing
//! - [`config`]: cluster membership, port assignment, node options
//! - [`retry`]: bounded backoff for the startup broadcast
//! - [`outbound`]: request/reply links to peers
//! - [`listener`]: supervised per-peer inbound workers
//! - [`mailbox`]: queues between listeners and the coordinator
//! - [`election`]: traits for the election machine and follower duties
//! - [`bully`]: default Bully election and leader probe
//! - [`coordinator`]: node construction and the coordinator loop
//! - [`cli`]: command-line arguments of the `bully-node` binary

pub mod bully;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod mailbox;
pub mod outbound;
pub mod retry;

pub use bully::{BullyElection, BullyMessage, LeaderProbe};
pub use config::{ClusterConfig, ConfigError, NodeOptions, PeerEntry};
pub use coordinator::{BullyConnection, NodeHandle};
pub use election::{ElectionContext, ElectionStateMachine, ReplicaBehavior};
pub use envelope::{Envelope, HostId, Layer};
pub use error::{LinkError, NodeError};
pub use retry::RetryPolicy;
