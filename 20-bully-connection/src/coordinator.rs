//! Node construction and the coordinator loop.
//!
//! [`BullyConnection`] owns every peer link of a node. Construction binds one
//! listening port per peer (consecutive from `lowest_port`), spawns the
//! supervised listener tasks and opens the outbound links. [`start`] then
//! announces an election to the cluster and runs the coordinator loop until
//! shutdown.
//!
//! # Threading model
//!
//! - **Listener tasks** (one per peer): accept the peer's connection, ACK
//!   liveness probes, forward election messages.
//! - **Coordinator** (the task calling `start`): sole owner of the election
//!   machine, the replica behavior and the outbound links. It never shares
//!   them; listeners talk to it through the mailbox queues only.
//!
//! # Tick
//!
//! Each iteration runs the replica step (at most once per `tick_interval`,
//! and only while some other node leads), drains the inbound queue, then waits
//! for the next message, the next tick or shutdown, whichever comes first.
//!
//! [`start`]: BullyConnection::start

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bully::{BullyElection, LeaderProbe};
use crate::config::{ClusterConfig, NodeOptions};
use crate::election::{ElectionContext, ElectionStateMachine, ReplicaBehavior};
use crate::envelope::HostId;
use crate::error::NodeError;
use crate::listener::{bind_listener, spawn_listener};
use crate::mailbox::Mailbox;
use crate::outbound::Connections;

/// Cheap, cloneable view of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    host_id: HostId,
    leader: watch::Receiver<Option<HostId>>,
    listener_ports: BTreeMap<HostId, u16>,
    shutdown: CancellationToken,
}

impl NodeHandle {
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Leader as of the coordinator's last step. Never blocks.
    pub fn current_leader(&self) -> Option<HostId> {
        *self.leader.borrow()
    }

    /// Waits until the published leader changes. Returns `None` once the
    /// node has stopped.
    pub async fn leader_changed(&mut self) -> Option<Option<HostId>> {
        self.leader.changed().await.ok()?;
        Some(*self.leader.borrow_and_update())
    }

    /// Port this node listens on for `peer`.
    pub fn listener_port(&self, peer: HostId) -> Option<u16> {
        self.listener_ports.get(&peer).copied()
    }

    pub fn listener_ports(&self) -> &BTreeMap<HostId, u16> {
        &self.listener_ports
    }

    /// Stops the coordinator and every listener.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct BullyConnection<E = BullyElection, R = LeaderProbe> {
    host_id: HostId,
    options: NodeOptions,
    connections: Connections,
    mailbox: Mailbox,
    election: E,
    replica: R,
    listeners: Vec<JoinHandle<()>>,
    listener_ports: BTreeMap<HostId, u16>,
    leader_tx: watch::Sender<Option<HostId>>,
    shutdown: CancellationToken,
}

impl BullyConnection {
    /// Builds a node running the Bully algorithm with default options.
    pub async fn new(
        cluster: ClusterConfig,
        lowest_port: u16,
        host_id: HostId,
    ) -> Result<Self, NodeError> {
        Self::with_options(cluster, lowest_port, host_id, NodeOptions::default()).await
    }

    pub async fn with_options(
        cluster: ClusterConfig,
        lowest_port: u16,
        host_id: HostId,
        options: NodeOptions,
    ) -> Result<Self, NodeError> {
        Self::with_collaborators(
            cluster,
            lowest_port,
            host_id,
            options,
            BullyElection::new(host_id),
            LeaderProbe::new(),
        )
        .await
    }
}

impl<E, R> BullyConnection<E, R>
where
    E: ElectionStateMachine,
    R: ReplicaBehavior<E>,
{
    /// Binds every listener, spawns the listener tasks and opens every
    /// outbound link.
    ///
    /// # Errors
    ///
    /// - The cluster configuration is invalid (duplicate ids, self listed as
    ///   a peer, port range overflow).
    /// - A listener port cannot be bound.
    ///
    /// Unreachable peers are not an error here; the startup broadcast retries
    /// them.
    pub async fn with_collaborators(
        cluster: ClusterConfig,
        lowest_port: u16,
        host_id: HostId,
        options: NodeOptions,
        election: E,
        replica: R,
    ) -> Result<Self, NodeError> {
        cluster.validate(host_id)?;
        let ports = cluster.listener_ports(lowest_port)?;

        // Bind everything before spawning anything so a taken port fails
        // construction cleanly.
        let mut bound = Vec::with_capacity(ports.len());
        for &(peer, port) in &ports {
            let listener = bind_listener(port, options.listen_backlog)
                .map_err(|source| NodeError::Bind { port, source })?;
            bound.push((peer, listener));
        }

        let shutdown = CancellationToken::new();
        let (mailbox, channels) =
            Mailbox::new(host_id, cluster.peer_ids(), options.inbound_capacity);
        let listeners = bound
            .into_iter()
            .zip(channels)
            .map(|((peer, listener), (_, channels))| {
                spawn_listener(peer, host_id, listener, channels, shutdown.child_token())
            })
            .collect();

        let connections = Connections::open_all(cluster.peers(), options.socket_timeout).await;
        let (leader_tx, _) = watch::channel(election.current_leader());

        info!(host = host_id, peers = cluster.len(), lowest_port, "node constructed");
        Ok(Self {
            host_id,
            options,
            connections,
            mailbox,
            election,
            replica,
            listeners,
            listener_ports: ports.into_iter().collect(),
            leader_tx,
            shutdown,
        })
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Delegates to the election machine. Never blocks and never touches
    /// the queues.
    pub fn current_leader(&self) -> Option<HostId> {
        self.election.current_leader()
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            host_id: self.host_id,
            leader: self.leader_tx.subscribe(),
            listener_ports: self.listener_ports.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Announces an election to every peer, then runs the coordinator loop
    /// until [`NodeHandle::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// [`NodeError::StartupExhausted`] if no peer could be reached within the
    /// startup retry budget. Listener tasks are stopped before returning.
    pub async fn start(mut self) -> Result<(), NodeError> {
        let shutdown = self.shutdown.clone();
        let startup = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = self.startup_broadcast() => result,
        };
        if let Err(err) = startup {
            self.stop().await;
            return Err(err);
        }
        self.publish_leader();

        if !self.shutdown.is_cancelled() {
            self.run().await;
        }
        self.stop().await;
        Ok(())
    }

    /// Sends the election announcement to every peer, retrying peers that
    /// cannot be reached with the configured backoff.
    async fn startup_broadcast(&mut self) -> Result<(), NodeError> {
        let policy = self.options.startup_retry.clone();
        let leader = self.election.current_leader();
        let mut ctx = ElectionContext::new(
            self.host_id,
            leader,
            &mut self.connections,
            &mut self.mailbox,
            &mut self.election,
        );

        let payload = ctx.election().begin_election();
        let mut pending = ctx.peer_ids();
        let mut reached = pending.is_empty();
        let mut attempt = 1;
        info!(host = ctx.self_id(), peers = pending.len(), "announcing election to the cluster");

        while !pending.is_empty() {
            let replies = ctx.send_to(&pending, payload.clone()).await;
            let mut answered = Vec::new();
            pending.clear();
            for (peer, reply) in replies {
                match reply {
                    Err(err) if err.is_retryable() => {
                        warn!(peer, attempt, error = %err, "peer unreachable during startup");
                        pending.push(peer);
                    }
                    Err(err) => {
                        // The peer accepted the connection, so it is up.
                        warn!(peer, error = %err, "peer did not answer election announcement");
                        reached = true;
                    }
                    Ok(envelope) => {
                        reached = true;
                        answered.push((peer, Ok(envelope)));
                    }
                }
            }
            ctx.absorb(answered);

            if pending.is_empty() || !policy.should_retry(attempt) {
                break;
            }
            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, ?pending, "retrying startup broadcast");
            ctx.idle(delay).await;
            attempt += 1;
        }

        if !reached {
            return Err(NodeError::StartupExhausted {
                attempts: attempt,
                unreachable: pending,
            });
        }
        if !pending.is_empty() {
            warn!(unreachable = ?pending, "continuing without unreachable peers");
        }

        ctx.finish_election().await;
        Ok(())
    }

    async fn run(&mut self) {
        let tick = self.options.tick_interval;
        let mut last_step: Option<Instant> = None;

        loop {
            let due = match last_step {
                Some(at) => at.elapsed() >= tick,
                None => true,
            };
            if due {
                self.replica_step().await;
                last_step = Some(Instant::now());
            }

            let handled = self.mailbox.drain(&mut self.election);
            if handled > 0 {
                debug!(handled, "drained inbound queue");
            }
            self.publish_leader();

            let wait = last_step
                .map(|at| tick.saturating_sub(at.elapsed()))
                .unwrap_or_default();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(message) = self.mailbox.recv() => {
                    self.mailbox.answer(message, &mut self.election);
                }
                _ = tokio::time::sleep(wait) => {}
            }
            self.publish_leader();
        }

        info!(host = self.host_id, "coordinator stopped");
    }

    /// Runs the follower duties if a leader is known and it is not us.
    async fn replica_step(&mut self) {
        let Some(leader) = self.election.current_leader() else {
            return;
        };
        if !should_follow(self.host_id, Some(leader)) {
            return;
        }

        let mut ctx = ElectionContext::new(
            self.host_id,
            Some(leader),
            &mut self.connections,
            &mut self.mailbox,
            &mut self.election,
        );
        self.replica.execute_tasks(&mut ctx).await;
    }

    fn publish_leader(&self) {
        let leader = self.election.current_leader();
        self.leader_tx.send_if_modified(|published| {
            if *published == leader {
                return false;
            }
            *published = leader;
            true
        });
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        for listener in self.listeners.drain(..) {
            if let Err(err) = listener.await {
                warn!(error = %err, "listener task ended abnormally");
            }
        }
    }
}

impl<E, R> Drop for BullyConnection<E, R> {
    fn drop(&mut self) {
        // Listener tasks outlive the node otherwise and keep their ports bound.
        self.shutdown.cancel();
    }
}

/// The replica step runs only while a leader is known and it is someone else.
fn should_follow(host_id: HostId, leader: Option<HostId>) -> bool {
    matches!(leader, Some(leader) if leader != host_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_step_guard_requires_a_foreign_leader() {
        assert!(!should_follow(2, None));
        assert!(!should_follow(2, Some(2)));
        assert!(should_follow(2, Some(3)));
        assert!(should_follow(2, Some(1)));
    }
}
