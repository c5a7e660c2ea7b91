//! Outbound half of a peer link.
//!
//! Each peer gets one long-lived TCP connection used in strict
//! request/reply fashion: write one envelope, read exactly one envelope back.
//! Only the coordinator task owns [`Connections`], so writes to a given peer
//! are serialized by `&mut` access rather than by a lock.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::PeerEntry;
use crate::envelope::{read_envelope, write_envelope, Envelope, HostId};
use crate::error::LinkError;

struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct OutboundLink {
    peer: HostId,
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<Stream>,
}

impl OutboundLink {
    /// Connects to `host:port`, failing if the peer does not accept within
    /// `timeout`.
    pub async fn open(
        peer: HostId,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let mut link = Self::disconnected(peer, host, port, timeout);
        link.ensure_connected().await?;
        Ok(link)
    }

    /// A link that will connect on its first request.
    pub fn disconnected(peer: HostId, host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            peer,
            host: host.into(),
            port,
            timeout,
            stream: None,
        }
    }

    pub fn peer(&self) -> HostId {
        self.peer
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(LinkError::Connect {
                    peer: self.peer,
                    addr: self.addr(),
                    source,
                })
            }
            Err(_) => {
                return Err(LinkError::ConnectTimeout {
                    peer: self.peer,
                    addr: self.addr(),
                })
            }
        };
        // Envelopes are tiny and latency-bound.
        let _ = stream.set_nodelay(true);

        info!(peer = self.peer, addr = %self.addr(), "outbound link connected");
        let (reader, writer) = stream.into_split();
        self.stream = Some(Stream {
            reader: BufReader::new(reader),
            writer,
        });
        Ok(())
    }

    /// Sends `envelope` and waits for the single reply.
    ///
    /// Any failure after connecting drops the socket: a late reply would
    /// otherwise be read as the answer to the next request. The next call
    /// reconnects.
    pub async fn request(&mut self, envelope: &Envelope) -> Result<Envelope, LinkError> {
        self.ensure_connected().await?;
        let result = self.exchange(envelope).await;
        if let Err(err) = &result {
            debug!(peer = self.peer, error = %err, "dropping outbound connection");
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, envelope: &Envelope) -> Result<Envelope, LinkError> {
        let peer = self.peer;
        let reply_timeout = self.timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::Closed { peer });
        };

        write_envelope(&mut stream.writer, envelope)
            .await
            .map_err(|source| LinkError::Codec { peer, source })?;

        match timeout(reply_timeout, read_envelope(&mut stream.reader)).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(LinkError::Closed { peer }),
            Ok(Err(source)) => Err(LinkError::Codec { peer, source }),
            Err(_) => Err(LinkError::ReplyTimeout {
                peer,
                timeout: reply_timeout,
            }),
        }
    }
}

/// Outbound links to every configured peer, keyed by peer id.
pub struct Connections {
    links: BTreeMap<HostId, OutboundLink>,
}

impl Connections {
    /// Opens a link to every peer. Peers that are not reachable yet are
    /// kept as disconnected links and retried on first use.
    pub async fn open_all(peers: &[PeerEntry], timeout: Duration) -> Self {
        let mut links = BTreeMap::new();
        for peer in peers {
            let link = match OutboundLink::open(peer.id, peer.host.clone(), peer.port, timeout).await {
                Ok(link) => link,
                Err(err) => {
                    info!(peer = peer.id, error = %err, "peer not reachable yet, will retry");
                    OutboundLink::disconnected(peer.id, peer.host.clone(), peer.port, timeout)
                }
            };
            links.insert(peer.id, link);
        }
        Self { links }
    }

    pub fn peer_ids(&self) -> Vec<HostId> {
        self.links.keys().copied().collect()
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut OutboundLink> {
        self.links.values_mut()
    }

    pub async fn request(&mut self, peer: HostId, envelope: &Envelope) -> Result<Envelope, LinkError> {
        self.links
            .get_mut(&peer)
            .ok_or(LinkError::UnknownPeer(peer))?
            .request(envelope)
            .await
    }
}

impl FromIterator<OutboundLink> for Connections {
    fn from_iter<I: IntoIterator<Item = OutboundLink>>(iter: I) -> Self {
        Self {
            links: iter.into_iter().map(|link| (link.peer(), link)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_fails_fast_when_nothing_listens() {
        // Grab a free port, then release it so the connect is refused.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let err = OutboundLink::open(1, "127.0.0.1", port, Duration::from_secs(2))
            .await
            .err()
            .expect("connect should fail");
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn request_reads_exactly_one_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let request = read_envelope(&mut reader)
                .await
                .expect("read")
                .expect("request");
            write_envelope(&mut writer, &Envelope::ack(9))
                .await
                .expect("reply");
            request
        });

        let mut link = OutboundLink::open(9, "127.0.0.1", port, Duration::from_secs(2))
            .await
            .expect("open");
        let reply = link
            .request(&Envelope::bully(json!("ELECTION"), 1))
            .await
            .expect("reply");
        assert!(reply.is_ack_from(9));
        assert_eq!(
            server.await.expect("server task"),
            Envelope::bully(json!("ELECTION"), 1)
        );
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_link_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let mut link = OutboundLink::open(4, "127.0.0.1", port, Duration::from_millis(100))
            .await
            .expect("open");
        let err = link.request(&Envelope::probe(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::ReplyTimeout { peer: 4, .. }));
        assert!(!link.is_connected());
        let _ = server.await;
    }

    #[tokio::test]
    async fn unknown_peer_is_reported() {
        let mut connections: Connections = std::iter::empty().collect();
        let err = connections.request(3, &Envelope::probe(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::UnknownPeer(3)));
    }
}
