//! Inbound half of a peer link.
//!
//! Every configured peer gets its own listening port and its own task. A
//! session accepts a single connection and serves it until it ends:
//!
//! - `CONNECTION` envelopes are acknowledged on the spot.
//! - Malformed frames are logged and dropped; the session keeps reading.
//! - `BULLY` envelopes are forwarded to the coordinator through the shared
//!   inbound queue, and the session waits for exactly one reply on the link's
//!   response queue before reading the next envelope.
//!
//! The task around the session is a small supervisor: when a session ends
//! it accepts a fresh connection on the same socket, backing off if sessions
//! keep failing. A stalled peer only ever stalls its own link.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{read_envelope, write_envelope, CodecError, Envelope, HostId, Layer};

/// Backoff applied after consecutive failed sessions.
const SESSION_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// A `BULLY` message on its way to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Peer whose link received the message; the reply goes back on it.
    pub link: HostId,
    /// Sender as stated by the envelope.
    pub sender: HostId,
    pub message: Value,
}

/// Binds `0.0.0.0:port` with the given accept backlog.
pub fn bind_listener(port: u16, backlog: u32) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    socket.listen(backlog)
}

/// Everything a listener task needs besides its socket.
pub struct ListenerChannels {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub responses: mpsc::Receiver<Envelope>,
}

/// Spawns the supervised listener for `peer` on an already bound socket.
pub fn spawn_listener(
    peer: HostId,
    host_id: HostId,
    listener: TcpListener,
    channels: ListenerChannels,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker = ListenerWorker {
            peer,
            host_id,
            inbound: channels.inbound,
            responses: channels.responses,
        };
        worker.supervise(listener, shutdown).await;
    })
}

enum SessionEnd {
    PeerClosed,
    CoordinatorGone,
}

struct ListenerWorker {
    peer: HostId,
    host_id: HostId,
    inbound: mpsc::Sender<InboundMessage>,
    responses: mpsc::Receiver<Envelope>,
}

impl ListenerWorker {
    async fn supervise(&mut self, listener: TcpListener, shutdown: CancellationToken) {
        let port = listener.local_addr().map(|addr| addr.port()).ok();
        info!(peer = self.peer, ?port, "listening for peer");
        let mut failures = 0usize;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(peer = self.peer, error = %err, "failed to accept peer connection");
                    failures += 1;
                    if !pause(&shutdown, backoff(failures)).await {
                        break;
                    }
                    continue;
                }
            };
            info!(peer = self.peer, %remote, "peer connected");

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.serve(stream) => outcome,
            };

            match outcome {
                Ok(SessionEnd::PeerClosed) => {
                    info!(peer = self.peer, "peer closed the link, awaiting a fresh connection");
                    failures = 0;
                }
                Ok(SessionEnd::CoordinatorGone) => {
                    debug!(peer = self.peer, "coordinator gone, listener exiting");
                    break;
                }
                Err(err) => {
                    failures += 1;
                    let delay = backoff(failures);
                    warn!(
                        peer = self.peer,
                        error = %err,
                        restarts = failures,
                        backoff_ms = delay.as_millis() as u64,
                        "peer session failed, relaunching"
                    );
                    if !pause(&shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        debug!(peer = self.peer, "listener stopped");
    }

    /// Serves one accepted connection until it closes or breaks.
    async fn serve(&mut self, stream: TcpStream) -> Result<SessionEnd, CodecError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let envelope = match read_envelope(&mut reader).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Ok(SessionEnd::PeerClosed),
                Err(err) if err.is_recoverable() => {
                    warn!(peer = self.peer, error = %err, "dropping malformed envelope");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let reply = match envelope.layer {
                Layer::Connection => Envelope::ack(self.host_id),
                Layer::Bully => match self.forward(envelope).await {
                    Some(reply) => reply,
                    None => return Ok(SessionEnd::CoordinatorGone),
                },
            };

            write_envelope(&mut writer, &reply).await?;
        }
    }

    /// Hands a `BULLY` envelope to the coordinator and waits for its reply.
    ///
    /// Returns `None` once the coordinator has dropped its end of either queue.
    async fn forward(&mut self, envelope: Envelope) -> Option<Envelope> {
        let message = InboundMessage {
            link: self.peer,
            sender: envelope.host_id,
            message: envelope.message,
        };

        match self.inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(rejected)) => {
                warn!(
                    peer = self.peer,
                    sender = rejected.sender,
                    "inbound queue full, rejecting election message"
                );
                return Some(Envelope::ack(self.host_id));
            }
            Err(TrySendError::Closed(_)) => return None,
        }

        self.responses.recv().await
    }
}

fn backoff(failures: usize) -> Duration {
    let idx = failures.saturating_sub(1).min(SESSION_BACKOFF.len() - 1);
    SESSION_BACKOFF[idx]
}

/// Sleeps for `delay`; returns false if shutdown fired first.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(5));
        assert_eq!(backoff(50), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn bind_listener_reserves_the_requested_port() {
        let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        let listener = bind_listener(port, 5).expect("bind listener");
        assert_eq!(listener.local_addr().expect("addr").port(), port);
        assert!(bind_listener(port, 5).is_err(), "port should be taken");
    }
}
