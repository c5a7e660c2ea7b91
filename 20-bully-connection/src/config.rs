//! Cluster membership and node tuning.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::HostId;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("peer id {0} appears more than once")]
    DuplicatePeer(HostId),
    #[error("host id {0} must not be listed as its own peer")]
    SelfAsPeer(HostId),
    #[error("{count} listener ports starting at {lowest_port} do not fit in the port range")]
    PortRangeOverflow { lowest_port: u16, count: usize },
    #[error("invalid peer entry '{entry}': {reason}")]
    InvalidPeerEntry { entry: String, reason: String },
}

/// One remote member of the cluster and the address of the listener it
/// reserved for this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: HostId,
    pub host: String,
    pub port: u16,
}

impl PeerEntry {
    pub fn new(id: HostId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id, self.addr())
    }
}

/// Parses `id=host:port`, the format accepted on the command line.
impl FromStr for PeerEntry {
    type Err = ConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPeerEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (id, addr) = entry
            .trim()
            .split_once('=')
            .ok_or_else(|| invalid("expected id=host:port"))?;
        let id = id.parse().map_err(|_| invalid("peer id is not a number"))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("address is missing a port"))?;
        if host.is_empty() {
            return Err(invalid("address is missing a host"));
        }
        let port = port.parse().map_err(|_| invalid("port is not a number"))?;

        Ok(Self::new(id, host, port))
    }
}

/// Ordered set of peers this node talks to.
///
/// Order matters: the i-th entry owns listener port `lowest_port + i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    peers: Vec<PeerEntry>,
}

impl ClusterConfig {
    pub fn new(peers: Vec<PeerEntry>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.peers.iter().map(|peer| peer.id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Checks that ids are unique and that `host_id` is not among them.
    pub fn validate(&self, host_id: HostId) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.id == host_id {
                return Err(ConfigError::SelfAsPeer(host_id));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
        }
        Ok(())
    }

    /// Assigns one listener port per peer, consecutively from `lowest_port`
    /// in enumeration order.
    pub fn listener_ports(&self, lowest_port: u16) -> Result<Vec<(HostId, u16)>, ConfigError> {
        let overflow = || ConfigError::PortRangeOverflow {
            lowest_port,
            count: self.peers.len(),
        };

        self.peers
            .iter()
            .enumerate()
            .map(|(offset, peer)| {
                let offset = u16::try_from(offset).map_err(|_| overflow())?;
                let port = lowest_port.checked_add(offset).ok_or_else(overflow)?;
                Ok((peer.id, port))
            })
            .collect()
    }
}

impl FromIterator<PeerEntry> for ClusterConfig {
    fn from_iter<I: IntoIterator<Item = PeerEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Timing and capacity knobs for a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Minimum spacing between two replica steps.
    pub tick_interval: Duration,
    /// Connect timeout and reply timeout on outbound links.
    pub socket_timeout: Duration,
    pub listen_backlog: u32,
    /// Capacity of the inbound queue shared by all listeners.
    pub inbound_capacity: usize,
    pub startup_retry: RetryPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            socket_timeout: Duration::from_secs(2),
            listen_backlog: 5,
            inbound_capacity: 64,
            startup_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_peers() -> ClusterConfig {
        ClusterConfig::new(vec![
            PeerEntry::new(1, "127.0.0.1", 9100),
            PeerEntry::new(2, "127.0.0.1", 9200),
        ])
    }

    #[test]
    fn ports_are_consecutive_from_lowest_port() {
        let ports = two_peers().listener_ports(9000).expect("ports");
        assert_eq!(ports, vec![(1, 9000), (2, 9001)]);
    }

    #[test]
    fn port_assignment_detects_overflow() {
        let err = two_peers().listener_ports(u16::MAX).unwrap_err();
        assert_eq!(
            err,
            ConfigError::PortRangeOverflow {
                lowest_port: u16::MAX,
                count: 2
            }
        );
        assert!(two_peers().listener_ports(u16::MAX - 1).is_ok());
    }

    #[test]
    fn validation_rejects_self_and_duplicates() {
        assert!(two_peers().validate(3).is_ok());
        assert_eq!(two_peers().validate(2), Err(ConfigError::SelfAsPeer(2)));

        let duplicated = ClusterConfig::new(vec![
            PeerEntry::new(4, "10.0.0.1", 1),
            PeerEntry::new(4, "10.0.0.2", 2),
        ]);
        assert_eq!(duplicated.validate(1), Err(ConfigError::DuplicatePeer(4)));
    }

    #[test]
    fn empty_cluster_is_valid() {
        let empty = ClusterConfig::default();
        assert!(empty.validate(1).is_ok());
        assert!(empty.listener_ports(9000).expect("ports").is_empty());
    }

    #[test]
    fn parses_peer_entries() {
        let entry: PeerEntry = "2=127.0.0.1:9101".parse().expect("valid entry");
        assert_eq!(entry, PeerEntry::new(2, "127.0.0.1", 9101));
        assert_eq!(entry.to_string(), "2=127.0.0.1:9101");

        assert!("2-127.0.0.1:9101".parse::<PeerEntry>().is_err());
        assert!("x=127.0.0.1:9101".parse::<PeerEntry>().is_err());
        assert!("2=127.0.0.1".parse::<PeerEntry>().is_err());
        assert!("2=:9101".parse::<PeerEntry>().is_err());
        assert!("2=host:99999".parse::<PeerEntry>().is_err());
    }
}
