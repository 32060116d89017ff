//! Relay and Bridge: the owners of a LinkRegistry
//!
//! A relay server accepts peers and rebroadcasts every envelope to all
//! other peers. A bridge keeps one always-reconnecting upstream link for a
//! local producer.

pub mod addr;
pub mod bridge;
pub mod dedup;
pub mod dialer;
pub mod handler;
pub mod server;

pub use addr::{parse_peer_list, PeerAddr, PeerKeyStrategy};
pub use bridge::{Bridge, BridgeConfig, BridgeStats, DEFAULT_APPLICATION_ID};
pub use dedup::SeenCache;
pub use dialer::ReconnectPolicy;
pub use handler::EnvelopeHandler;
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};

use std::net::SocketAddr;
use thiserror::Error;

/// Default TCP port of a relay server
pub const DEFAULT_RELAY_PORT: u16 = 56487;

/// Relay / bridge error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Registry deliveries already claimed by another owner")]
    RegistryInUse,
    #[error("Already started")]
    AlreadyStarted,
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddr(String),
}
