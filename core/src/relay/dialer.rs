// Outbound dialing with reconnect

use super::addr::PeerAddr;
use crate::link::{LinkRegistry, LinkRole};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Relay servers re-dial configured peers every 2 seconds
    pub const SERVER_DEFAULT: ReconnectPolicy = ReconnectPolicy::Fixed(Duration::from_secs(2));
    /// Bridges retry their upstream every 500 ms
    pub const BRIDGE_DEFAULT: ReconnectPolicy = ReconnectPolicy::Fixed(Duration::from_millis(500));

    /// Delay before attempt `attempt` (0 = first retry)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Open a TCP connection to `peer`, bounded by `connect_timeout` if set
pub async fn dial(peer: &PeerAddr, connect_timeout: Option<Duration>) -> io::Result<TcpStream> {
    let target = (peer.host.as_str(), peer.port);
    let stream = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => TcpStream::connect(target).await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Keep the outbound link to `peer` connected until `cancel` fires.
///
/// Each successful dial is attached to the peer's Link in `registry`; after
/// the link drops the socket, wait `policy.delay` and dial again. The Link
/// and its queue persist across attempts.
pub async fn supervise_outbound(
    registry: Arc<LinkRegistry>,
    peer: PeerAddr,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let key = peer.peer_key();
    let connect_timeout = registry.config().connect_timeout;
    let mut failures: u32 = 0;

    loop {
        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            result = dial(&peer, connect_timeout) => result,
        };

        match dialed {
            Ok(stream) => {
                if failures > 0 {
                    info!("Reconnected to {} after {} failed attempts", peer, failures);
                } else {
                    info!("Connected to {}", peer);
                }
                failures = 0;

                let link = registry.get_or_create(key.clone(), LinkRole::Outbound, stream);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = link.disconnected() => {
                        warn!("Lost connection to {}, will re-dial", peer);
                    }
                }
            }
            Err(e) => {
                if failures == 0 {
                    warn!("Failed to connect to {}: {}", peer, e);
                } else {
                    debug!("Connect attempt {} to {} failed: {}", failures + 1, peer, e);
                }
                failures = failures.saturating_add(1);
            }
        }

        let delay = policy.delay(failures.saturating_sub(1));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Stopped dialing {}", peer);
}
