//! Seams between the connection layer and the election logic.
//!
//! The coordinator does not decide who leads. It pumps messages into an
//! [`ElectionStateMachine`] and, once per tick while a leader is known, lets a
//! [`ReplicaBehavior`] perform follower duties through an
//! [`ElectionContext`].

use std::future::Future;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, HostId, Layer};
use crate::error::LinkError;
use crate::mailbox::Mailbox;
use crate::outbound::Connections;

/// Leadership decisions, driven entirely by the messages fed into it.
pub trait ElectionStateMachine: Send {
    /// Current leader, if one is known. Must not block or mutate.
    fn current_leader(&self) -> Option<HostId>;

    /// Handles a `BULLY` payload from `sender`.
    ///
    /// `Some` is sent back to the sender; `None` is answered with a plain ACK.
    fn receive_message(&mut self, sender: HostId, message: &Value) -> Option<Value>;

    /// Starts a new election round and returns the payload to broadcast.
    fn begin_election(&mut self) -> Value;

    /// Ends the round after every reply has been fed back through
    /// [`receive_message`](Self::receive_message). Returns the victory
    /// announcement to broadcast if this node won.
    fn conclude_election(&mut self) -> Option<Value>;
}

/// Follower duty cycle, run once per tick while another node leads.
pub trait ReplicaBehavior<E: ElectionStateMachine>: Send {
    fn execute_tasks(&mut self, ctx: &mut ElectionContext<'_, E>) -> impl Future<Output = ()> + Send;
}

/// Replies collected from a broadcast, in peer id order.
pub type Replies = Vec<(HostId, Result<Envelope, LinkError>)>;

/// What a replica step gets to work with: the outbound connections, this
/// node's id, the leader it follows and the election machine.
///
/// Every method that waits on the network keeps answering inbound election
/// messages meanwhile. Two nodes messaging each other at the same moment
/// would otherwise each wait on a coordinator that is busy waiting on them.
pub struct ElectionContext<'a, E> {
    self_id: HostId,
    leader: Option<HostId>,
    connections: &'a mut Connections,
    mailbox: &'a mut Mailbox,
    election: &'a mut E,
}

impl<'a, E> ElectionContext<'a, E>
where
    E: ElectionStateMachine,
{
    pub(crate) fn new(
        self_id: HostId,
        leader: Option<HostId>,
        connections: &'a mut Connections,
        mailbox: &'a mut Mailbox,
        election: &'a mut E,
    ) -> Self {
        Self {
            self_id,
            leader,
            connections,
            mailbox,
            election,
        }
    }

    pub fn self_id(&self) -> HostId {
        self.self_id
    }

    /// The leader this step was started for.
    pub fn leader(&self) -> Option<HostId> {
        self.leader
    }

    pub fn election(&mut self) -> &mut E {
        &mut *self.election
    }

    pub fn peer_ids(&self) -> Vec<HostId> {
        self.connections.peer_ids()
    }

    /// Sends a connection-layer probe to `peer` and returns its reply.
    pub async fn probe(&mut self, peer: HostId) -> Result<Envelope, LinkError> {
        let envelope = Envelope::probe(self.self_id);
        let Self {
            connections,
            mailbox,
            election,
            ..
        } = self;

        let request = connections.request(peer, &envelope);
        tokio::pin!(request);
        loop {
            tokio::select! {
                reply = &mut request => return reply,
                Some(message) = mailbox.recv() => mailbox.answer(message, &mut **election),
            }
        }
    }

    /// Sends `payload` on the bully layer to every peer concurrently.
    pub async fn broadcast(&mut self, payload: Value) -> Replies {
        let targets = self.connections.peer_ids();
        self.send_to(&targets, payload).await
    }

    /// Sends `payload` on the bully layer to `targets` concurrently.
    pub async fn send_to(&mut self, targets: &[HostId], payload: Value) -> Replies {
        let envelope = Envelope::bully(payload, self.self_id);
        let Self {
            connections,
            mailbox,
            election,
            ..
        } = self;

        let envelope = &envelope;
        let requests = join_all(
            connections
                .links_mut()
                .filter(|link| targets.contains(&link.peer()))
                .map(|link| async move { (link.peer(), link.request(envelope).await) }),
        );
        tokio::pin!(requests);
        loop {
            tokio::select! {
                replies = &mut requests => return replies,
                Some(message) = mailbox.recv() => mailbox.answer(message, &mut **election),
            }
        }
    }

    /// Waits for `delay` while answering inbound messages.
    pub async fn idle(&mut self, delay: std::time::Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                Some(message) = self.mailbox.recv() => self.mailbox.answer(message, &mut *self.election),
            }
        }
    }

    /// Feeds election replies back into the machine. Plain ACKs and
    /// failures carry no election information.
    pub fn absorb(&mut self, replies: Replies) {
        for (peer, reply) in replies {
            match reply {
                Ok(envelope) if envelope.layer == Layer::Bully => {
                    // The exchange is already complete; any counter-reply is moot.
                    let _ = self.election.receive_message(peer, &envelope.message);
                }
                Ok(_) => {}
                Err(err) => debug!(peer, error = %err, "no election reply"),
            }
        }
    }

    /// Runs a full election round: announce, collect, conclude and, if this
    /// node won, tell everyone.
    pub async fn run_election(&mut self) {
        let payload = self.election.begin_election();
        info!(host = self.self_id, "starting election");
        let replies = self.broadcast(payload).await;
        self.absorb(replies);
        self.finish_election().await;
    }

    /// Concludes the current round and broadcasts the outcome if we won.
    pub(crate) async fn finish_election(&mut self) {
        match self.election.conclude_election() {
            Some(announcement) => {
                info!(host = self.self_id, "won election, announcing leadership");
                let replies = self.broadcast(announcement).await;
                let unreachable = replies.iter().filter(|(_, reply)| reply.is_err()).count();
                if unreachable > 0 {
                    warn!(unreachable, "leadership announcement did not reach every peer");
                }
                self.absorb(replies);
            }
            None => debug!(
                host = self.self_id,
                leader = ?self.election.current_leader(),
                "election concluded without a win"
            ),
        }
    }
}
