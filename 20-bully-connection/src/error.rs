use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::envelope::{CodecError, HostId};

/// Failure of a single request on an outbound peer link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer {peer} at {addr} is unreachable: {source}")]
    Connect {
        peer: HostId,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to peer {peer} at {addr}")]
    ConnectTimeout { peer: HostId, addr: String },
    #[error("peer {peer} did not reply within {timeout:?}")]
    ReplyTimeout { peer: HostId, timeout: Duration },
    #[error("peer {peer} closed the connection")]
    Closed { peer: HostId },
    #[error("exchange with peer {peer} failed: {source}")]
    Codec {
        peer: HostId,
        #[source]
        source: CodecError,
    },
    #[error("no link is configured for peer {0}")]
    UnknownPeer(HostId),
}

impl LinkError {
    /// Connectivity failures are worth retrying; everything else means the
    /// peer was reached and misbehaved.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }
}

/// Failure to bring a node up.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid cluster configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("startup election broadcast gave up after {attempts} attempts; unreachable peers: {unreachable:?}")]
    StartupExhausted {
        attempts: u32,
        unreachable: Vec<HostId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connect_failures_are_retryable() {
        let refused = LinkError::Connect {
            peer: 1,
            addr: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_retryable());
        assert!(LinkError::ConnectTimeout {
            peer: 1,
            addr: "127.0.0.1:1".into()
        }
        .is_retryable());

        assert!(!LinkError::Closed { peer: 1 }.is_retryable());
        assert!(!LinkError::ReplyTimeout {
            peer: 1,
            timeout: Duration::from_secs(2)
        }
        .is_retryable());
        assert!(!LinkError::UnknownPeer(9).is_retryable());
    }
}
