//! Coordinator side of the listener queues.
//!
//! The mailbox owns the receiving end of the shared inbound queue and the
//! sending end of every per-link response queue. Answering a message always
//! produces exactly one reply on the link that received it, because that
//! link's listener is parked until the reply arrives.

use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::election::ElectionStateMachine;
use crate::envelope::{Envelope, HostId};
use crate::listener::{InboundMessage, ListenerChannels};

pub struct Mailbox {
    host_id: HostId,
    inbound: mpsc::Receiver<InboundMessage>,
    responders: BTreeMap<HostId, mpsc::Sender<Envelope>>,
}

impl Mailbox {
    /// Creates the mailbox plus the listener-side channel ends for every
    /// link in `links`.
    pub fn new(
        host_id: HostId,
        links: impl IntoIterator<Item = HostId>,
        inbound_capacity: usize,
    ) -> (Self, Vec<(HostId, ListenerChannels)>) {
        let (inbound_tx, inbound) = mpsc::channel(inbound_capacity.max(1));
        let mut responders = BTreeMap::new();
        let mut listeners = Vec::new();

        for link in links {
            // One reply is outstanding per link at most.
            let (response_tx, response_rx) = mpsc::channel(1);
            responders.insert(link, response_tx);
            listeners.push((
                link,
                ListenerChannels {
                    inbound: inbound_tx.clone(),
                    responses: response_rx,
                },
            ));
        }

        let mailbox = Self {
            host_id,
            inbound,
            responders,
        };
        (mailbox, listeners)
    }

    /// Waits for the next inbound message.
    ///
    /// Returns `None` once every listener has exited. Cancel safe.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    /// True when no message is waiting to be answered.
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    /// Runs `message` through the election machine and routes the reply.
    ///
    /// A machine with nothing to say still produces a reply: the listener
    /// that forwarded the message is blocked until one arrives.
    pub fn answer<E>(&self, message: InboundMessage, election: &mut E)
    where
        E: ElectionStateMachine + ?Sized,
    {
        if message.sender != message.link {
            warn!(
                link = message.link,
                sender = message.sender,
                "envelope sender does not match the link it arrived on"
            );
        }

        let reply = match election.receive_message(message.sender, &message.message) {
            Some(payload) => Envelope::bully(payload, self.host_id),
            None => Envelope::ack(self.host_id),
        };

        let Some(responder) = self.responders.get(&message.link) else {
            error!(link = message.link, "no response queue for link, reply dropped");
            return;
        };
        match responder.try_send(reply) {
            Ok(()) => debug!(link = message.link, sender = message.sender, "reply queued"),
            Err(TrySendError::Full(_)) => {
                error!(link = message.link, "response queue already holds a reply, dropping")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(link = message.link, "listener gone, reply dropped")
            }
        }
    }

    /// Answers every queued message without waiting. Returns how many were
    /// handled.
    pub fn drain<E>(&mut self, election: &mut E) -> usize
    where
        E: ElectionStateMachine + ?Sized,
    {
        let mut handled = 0;
        while let Ok(message) = self.inbound.try_recv() {
            self.answer(message, election);
            handled += 1;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Answers `"ELECTION"` with `"ALIVE"` and stays silent otherwise.
    #[derive(Default)]
    struct Scripted {
        seen: Vec<(HostId, Value)>,
    }

    impl ElectionStateMachine for Scripted {
        fn current_leader(&self) -> Option<HostId> {
            None
        }

        fn receive_message(&mut self, sender: HostId, message: &Value) -> Option<Value> {
            self.seen.push((sender, message.clone()));
            (message == "ELECTION").then(|| json!("ALIVE"))
        }

        fn begin_election(&mut self) -> Value {
            json!("ELECTION")
        }

        fn conclude_election(&mut self) -> Option<Value> {
            None
        }
    }

    fn inbound(link: HostId, message: Value) -> InboundMessage {
        InboundMessage {
            link,
            sender: link,
            message,
        }
    }

    #[tokio::test]
    async fn draining_an_empty_queue_is_a_noop() {
        let (mut mailbox, _listeners) = Mailbox::new(5, [1, 2], 8);
        let mut election = Scripted::default();
        assert_eq!(mailbox.drain(&mut election), 0);
        assert!(election.seen.is_empty());
    }

    #[tokio::test]
    async fn every_drained_message_gets_exactly_one_reply() {
        let (mut mailbox, listeners) = Mailbox::new(5, [1, 2], 8);
        let mut channels: BTreeMap<_, _> = listeners.into_iter().collect();

        let to_coordinator = channels[&1].inbound.clone();
        to_coordinator
            .send(inbound(1, json!("ELECTION")))
            .await
            .expect("queue");
        to_coordinator
            .send(inbound(2, json!("COORDINATOR")))
            .await
            .expect("queue");

        let mut election = Scripted::default();
        assert_eq!(mailbox.drain(&mut election), 2);
        assert_eq!(
            election.seen,
            vec![(1, json!("ELECTION")), (2, json!("COORDINATOR"))]
        );

        let one = channels.get_mut(&1).expect("link 1");
        assert_eq!(
            one.responses.try_recv().expect("reply for 1"),
            Envelope::bully(json!("ALIVE"), 5)
        );
        assert!(one.responses.try_recv().is_err(), "only one reply per message");

        let two = channels.get_mut(&2).expect("link 2");
        assert_eq!(two.responses.try_recv().expect("reply for 2"), Envelope::ack(5));
    }

    #[tokio::test]
    async fn reply_follows_the_receiving_link_not_the_claimed_sender() {
        let (mailbox, listeners) = Mailbox::new(1, [1, 2], 8);
        let mut channels: BTreeMap<_, _> = listeners.into_iter().collect();

        let mut election = Scripted::default();
        mailbox.answer(
            InboundMessage {
                link: 1,
                sender: 2,
                message: json!("ELECTION"),
            },
            &mut election,
        );

        assert_eq!(election.seen, vec![(2, json!("ELECTION"))]);
        assert!(channels.get_mut(&1).expect("link 1").responses.try_recv().is_ok());
        assert!(channels.get_mut(&2).expect("link 2").responses.try_recv().is_err());
    }
}
