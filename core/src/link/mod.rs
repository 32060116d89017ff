// Link module: one managed connection per remote peer
//
// A Link owns an outbound FIFO queue and exactly two tasks: a sender that
// drains the queue onto the current socket, and a receiver that reads frames
// off it. Sockets come and go; the Link (and whatever is still queued)
// survives until shutdown.

pub mod queue;
pub mod registry;
pub mod session;

pub use queue::OutboundQueue;
pub use registry::LinkRegistry;
pub use session::{Link, LinkStats};

use crate::message::{Envelope, FrameWriteError, WireError, DEFAULT_MAX_FRAME_LEN};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// PEER IDENTITY
// ============================================================================

/// Stable identity of a remote peer, derived from its address.
///
/// At most one Link exists per key in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for PeerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Link state machine
///
/// `Connecting` → `Active` on the first socket, `Active` → `Reconnecting` on
/// any I/O failure, `Reconnecting` → `Active` on the next socket. There is
/// no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Created for an outbound peer that has not been reached yet
    Connecting,
    /// A socket is attached and believed healthy
    Active,
    /// The last socket failed; waiting for a fresh one
    Reconnecting,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkRole {
    /// Accepted by our listener; the remote side re-establishes it
    Inbound,
    /// Dialed by us; our dial supervisor re-establishes it
    Outbound,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Per-link tuning. The defaults reproduce the "no timeouts" behaviour.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Give up on a single frame write after this long (treated as a failure)
    pub write_timeout: Option<Duration>,
    /// Give up on a single dial attempt after this long
    pub connect_timeout: Option<Duration>,
    /// Largest frame body sent or accepted
    pub max_frame_len: usize,
    /// Envelopes of this group get an info line with send time once written
    pub audit_group: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            write_timeout: None,
            connect_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            audit_group: None,
        }
    }
}

// ============================================================================
// INBOUND DELIVERY
// ============================================================================

/// An envelope read by some Link's receiver, tagged with where it came from
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerKey,
    pub envelope: Envelope,
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failure to put one envelope on the wire
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("Envelope cannot be encoded: {0}")]
    Encode(#[from] WireError),
}

impl From<FrameWriteError> for LinkError {
    fn from(err: FrameWriteError) -> Self {
        match err {
            FrameWriteError::Encode(e) => LinkError::Encode(e),
            FrameWriteError::Io(e) => LinkError::Io(e),
        }
    }
}

impl LinkError {
    /// Whether the socket should be considered dead
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, LinkError::Encode(_))
    }
}
