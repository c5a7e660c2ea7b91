//! Default election collaborators.
//!
//! [`BullyElection`] implements the Bully algorithm: among the nodes that
//! answer, the one with the highest id leads. [`LeaderProbe`] is the follower
//! duty cycle: ping the leader every tick and call an election when it stops
//! answering.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::election::{ElectionContext, ElectionStateMachine, ReplicaBehavior};
use crate::envelope::HostId;

/// Payloads exchanged on the bully layer. Serialized as bare strings, e.g.
/// `"ELECTION"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BullyMessage {
    /// A candidate asks whether anyone with a higher id is alive.
    Election,
    /// A higher node answers a candidate: "I am alive, stand down".
    Alive,
    /// The sender declares itself leader.
    Coordinator,
}

impl BullyMessage {
    pub fn to_value(self) -> Value {
        // Unit variants always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

#[derive(Debug, Clone)]
pub struct BullyElection {
    host_id: HostId,
    leader: Option<HostId>,
    /// Higher peers that answered the current round.
    alive_higher: BTreeSet<HostId>,
}

impl BullyElection {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            leader: None,
            alive_higher: BTreeSet::new(),
        }
    }

    fn set_leader(&mut self, leader: HostId) {
        if self.leader != Some(leader) {
            info!(host = self.host_id, leader, "leader changed");
        }
        self.leader = Some(leader);
    }
}

impl ElectionStateMachine for BullyElection {
    fn current_leader(&self) -> Option<HostId> {
        self.leader
    }

    fn receive_message(&mut self, sender: HostId, message: &Value) -> Option<Value> {
        let Some(message) = BullyMessage::from_value(message) else {
            warn!(host = self.host_id, sender, %message, "ignoring unknown bully payload");
            return None;
        };

        match message {
            BullyMessage::Election if sender < self.host_id => {
                debug!(host = self.host_id, sender, "bullying lower candidate");
                Some(BullyMessage::Alive.to_value())
            }
            BullyMessage::Election => None,
            BullyMessage::Alive if sender > self.host_id => {
                self.alive_higher.insert(sender);
                if self.leader == Some(self.host_id) {
                    info!(host = self.host_id, sender, "higher node is alive, stepping down");
                    self.set_leader(sender);
                }
                None
            }
            BullyMessage::Alive => None,
            BullyMessage::Coordinator if sender > self.host_id => {
                self.set_leader(sender);
                None
            }
            BullyMessage::Coordinator => {
                debug!(host = self.host_id, sender, "rejecting lower coordinator");
                Some(BullyMessage::Alive.to_value())
            }
        }
    }

    fn begin_election(&mut self) -> Value {
        self.leader = None;
        self.alive_higher.clear();
        BullyMessage::Election.to_value()
    }

    fn conclude_election(&mut self) -> Option<Value> {
        match self.alive_higher.last().copied() {
            None => {
                self.set_leader(self.host_id);
                Some(BullyMessage::Coordinator.to_value())
            }
            Some(highest) => {
                // A coordinator may already have been received mid-round.
                if self.leader.is_none() {
                    self.set_leader(highest);
                }
                None
            }
        }
    }
}

/// Pings the leader over the connection layer once per tick and calls an
/// election if it does not acknowledge.
#[derive(Debug, Default, Clone)]
pub struct LeaderProbe;

impl LeaderProbe {
    pub fn new() -> Self {
        Self
    }
}

impl<E: ElectionStateMachine> ReplicaBehavior<E> for LeaderProbe {
    async fn execute_tasks(&mut self, ctx: &mut ElectionContext<'_, E>) {
        let Some(leader) = ctx.leader() else {
            return;
        };

        match ctx.probe(leader).await {
            Ok(reply) if reply.is_ack_from(leader) => {
                debug!(leader, "leader acknowledged probe");
            }
            Ok(reply) => {
                warn!(leader, ?reply, "unexpected probe reply, calling an election");
                ctx.run_election().await;
            }
            Err(err) => {
                warn!(leader, error = %err, "leader unresponsive, calling an election");
                ctx.run_election().await;
            }
        }
    }
}
