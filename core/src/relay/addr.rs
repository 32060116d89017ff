// Peer addresses and peer-key derivation

use super::{RelayError, DEFAULT_RELAY_PORT};
use crate::link::PeerKey;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A resolved-later `(host, port)` pair for an outbound peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, falling back to `default_port` when the port is
    /// omitted. IPv6 hosts must be bracketed when a port is given.
    pub fn parse_with_default(s: &str, default_port: u16) -> Result<Self, RelayError> {
        let s = s.trim();
        let invalid = || RelayError::InvalidPeerAddr(s.to_string());

        if s.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if s.matches(':').count() > 1 {
            // bare IPv6 literal, no port
            (s, None)
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => default_port,
        };

        Ok(Self::new(host, port))
    }

    /// Registry identity of the outbound link to this address
    pub fn peer_key(&self) -> PeerKey {
        PeerKey::new(self.to_string())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default(s, DEFAULT_RELAY_PORT)
    }
}

/// Parse a comma-separated `host[:port]` list
pub fn parse_peer_list(list: &str, default_port: u16) -> Result<Vec<PeerAddr>, RelayError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| PeerAddr::parse_with_default(s, default_port))
        .collect()
}

/// How an accepted connection's remote address becomes a peer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerKeyStrategy {
    /// `ip:port` of the remote socket
    #[default]
    RemoteAddr,
    /// Remote IP only, so a peer reconnecting from a new ephemeral port
    /// reclaims its existing link and queue
    RemoteHost,
}

impl PeerKeyStrategy {
    pub fn key_for(&self, remote: SocketAddr) -> PeerKey {
        match self {
            PeerKeyStrategy::RemoteAddr => PeerKey::from(remote),
            PeerKeyStrategy::RemoteHost => PeerKey::new(remote.ip().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let addr: PeerAddr = "relay.example.com:9001".parse().unwrap();
        assert_eq!(addr, PeerAddr::new("relay.example.com", 9001));
        assert_eq!(addr.peer_key().as_str(), "relay.example.com:9001");
    }

    #[test]
    fn test_parse_default_port() {
        let addr = PeerAddr::parse_with_default("10.0.0.7", 7777).unwrap();
        assert_eq!(addr.port, 7777);
        let addr: PeerAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(addr.port, DEFAULT_RELAY_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: PeerAddr = "[::1]:9001".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 9001);
        assert_eq!(addr.to_string(), "[::1]:9001");

        let bare: PeerAddr = "fe80::1".parse().unwrap();
        assert_eq!(bare.host, "fe80::1");
        assert_eq!(bare.port, DEFAULT_RELAY_PORT);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<PeerAddr>().is_err());
        assert!(":9001".parse::<PeerAddr>().is_err());
        assert!("host:notaport".parse::<PeerAddr>().is_err());
        assert!("host:70000".parse::<PeerAddr>().is_err());
        assert!("[::1".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_parse_peer_list() {
        let peers = parse_peer_list("a:1, b ,c:3,", 56487).unwrap();
        assert_eq!(
            peers,
            vec![
                PeerAddr::new("a", 1),
                PeerAddr::new("b", 56487),
                PeerAddr::new("c", 3)
            ]
        );
        assert!(parse_peer_list("a:1,b:x", 1).is_err());
    }

    #[test]
    fn test_peer_key_strategy() {
        let remote: SocketAddr = "192.168.1.5:51234".parse().unwrap();
        assert_eq!(PeerKeyStrategy::RemoteAddr.key_for(remote).as_str(), "192.168.1.5:51234");
        assert_eq!(PeerKeyStrategy::RemoteHost.key_for(remote).as_str(), "192.168.1.5");
    }
}
