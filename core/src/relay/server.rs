//! Relay Server: accepts peers and rebroadcasts every envelope to all others
//!
//! Inbound connections and configured outbound peers both become Links in
//! one registry. Every envelope received on any Link is enqueued on every
//! other Link, never echoed to its origin.

use super::addr::{PeerAddr, PeerKeyStrategy};
use super::dedup::SeenCache;
use super::dialer::{supervise_outbound, ReconnectPolicy};
use super::handler::{EnvelopeHandler, HandlerSlot};
use super::{RelayError, DEFAULT_RELAY_PORT};
use crate::link::{Delivery, Link, LinkRegistry, LinkRole, LinkState, LinkStats, PeerKey};
use crate::message::Envelope;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Peers to dial and keep connected
    pub peers: Vec<PeerAddr>,
    /// Delay between re-dials of a configured peer
    pub reconnect: ReconnectPolicy,
    /// Remember this many envelope ids and drop repeats (off when `None`)
    pub dedup_capacity: Option<NonZeroUsize>,
    /// Peer-key derivation for accepted connections
    pub peer_key_strategy: PeerKeyStrategy,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            peers: Vec::new(),
            reconnect: ReconnectPolicy::SERVER_DEFAULT,
            dedup_capacity: None,
            peer_key_strategy: PeerKeyStrategy::default(),
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Serialize)]
pub struct RelayServerStats {
    /// Links in the registry, any state
    pub links_total: usize,
    /// Links with a live socket
    pub links_active: usize,
    /// Envelopes waiting in all outbound queues
    pub queued_total: usize,
    /// Connections accepted since start
    pub connections_accepted: u64,
    /// Envelopes received from peers
    pub envelopes_received: u64,
    /// Per-link enqueues made by fan-out
    pub envelopes_forwarded: u64,
    /// Envelopes injected locally via `publish`
    pub envelopes_published: u64,
    /// Envelopes dropped as already seen
    pub duplicates_suppressed: u64,
    pub links: Vec<LinkStats>,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
    published: AtomicU64,
    duplicates: AtomicU64,
}

/// State shared by the server handle and its background tasks
struct Shared {
    registry: Arc<LinkRegistry>,
    handler: HandlerSlot,
    seen: Option<Mutex<SeenCache>>,
    counters: Counters,
}

impl Shared {
    /// Enqueue `envelope` on every Link except `origin`.
    ///
    /// Returns `None` when the envelope id was already seen.
    fn fan_out(&self, envelope: &Envelope, origin: Option<&PeerKey>) -> Option<usize> {
        if let Some(seen) = &self.seen {
            if !seen.lock().observe(envelope.id()) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(id = %envelope.id(), "Suppressed duplicate envelope");
                return None;
            }
        }

        let forwarded = self.registry.for_each_except(origin, |link| {
            link.enqueue(envelope.clone());
        });
        self.counters
            .forwarded
            .fetch_add(forwarded as u64, Ordering::Relaxed);
        Some(forwarded)
    }

    fn on_delivery(&self, delivery: Delivery) {
        let Delivery { from, envelope } = delivery;
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(forwarded) = self.fan_out(&envelope, Some(&from)) else {
            return;
        };
        debug!(
            id = %envelope.id(),
            group = %envelope.group(),
            from = %from,
            forwarded,
            "Relayed envelope"
        );

        self.handler.deliver(envelope, &from);
    }
}

/// The relay server
pub struct RelayServer {
    config: RelayServerConfig,
    shared: Arc<Shared>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    dialing: Mutex<HashSet<PeerKey>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a relay server that owns `registry`'s delivery stream.
    ///
    /// Fails with `RegistryInUse` if another owner already claimed it.
    pub fn new(config: RelayServerConfig, registry: Arc<LinkRegistry>) -> Result<Self, RelayError> {
        let deliveries = registry.take_deliveries().ok_or(RelayError::RegistryInUse)?;
        let seen = config.dedup_capacity.map(|cap| Mutex::new(SeenCache::new(cap)));

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                registry,
                handler: HandlerSlot::default(),
                seen,
                counters: Counters::default(),
            }),
            deliveries: Mutex::new(Some(deliveries)),
            dialing: Mutex::new(HashSet::new()),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Install a local consumer for relayed envelopes
    pub fn with_handler(self, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn set_handler(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.shared.handler.set(handler);
    }

    /// Bind the listener, then start accepting, dispatching, and dialing
    /// every configured peer. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        if self.deliveries.lock().is_none() {
            return Err(RelayError::AlreadyStarted);
        }

        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        let deliveries = self
            .deliveries
            .lock()
            .take()
            .ok_or(RelayError::AlreadyStarted)?;
        *self.local_addr.lock() = Some(local_addr);
        info!("Relay server listening on {}", local_addr);

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.config.peer_key_strategy,
            self.cancel.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            deliveries,
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([accept, dispatch]);

        for peer in self.config.peers.clone() {
            self.connect_to(peer);
        }

        Ok(local_addr)
    }

    /// Dial `peer` and keep it connected; its Link exists immediately and
    /// buffers fan-out until the first connect succeeds.
    pub fn connect_to(&self, peer: PeerAddr) -> Arc<Link> {
        let key = peer.peer_key();
        let link = self.shared.registry.ensure(key.clone(), LinkRole::Outbound);

        if self.dialing.lock().insert(key) {
            info!("Forwarding to {}", peer);
            let handle = tokio::spawn(supervise_outbound(
                Arc::clone(&self.shared.registry),
                peer,
                self.config.reconnect,
                self.cancel.clone(),
            ));
            self.tasks.lock().push(handle);
        }

        link
    }

    /// Inject a locally produced envelope into every Link
    pub fn publish(&self, envelope: Envelope) -> usize {
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
        self.shared.fan_out(&envelope, None).unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    /// Bound listen address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get server statistics
    pub fn get_stats(&self) -> RelayServerStats {
        let links = self.shared.registry.link_stats();
        let counters = &self.shared.counters;
        RelayServerStats {
            links_total: links.len(),
            links_active: links
                .iter()
                .filter(|l| l.state == LinkState::Active)
                .count(),
            queued_total: links.iter().map(|l| l.queue_depth).sum(),
            connections_accepted: counters.accepted.load(Ordering::Relaxed),
            envelopes_received: counters.received.load(Ordering::Relaxed),
            envelopes_forwarded: counters.forwarded.load(Ordering::Relaxed),
            envelopes_published: counters.published.load(Ordering::Relaxed),
            duplicates_suppressed: counters.duplicates.load(Ordering::Relaxed),
            links,
        }
    }

    /// Stop accepting and dialing, then stop every Link
    pub async fn shutdown(&self) {
        info!("Relay server shutting down");
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        join_all(handles).await;
        self.shared.registry.shutdown().await;
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    strategy: PeerKeyStrategy,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", remote, e);
                }
                let key = strategy.key_for(remote);
                info!("Accepted connection from {}", key);
                shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                shared.registry.get_or_create(key, LinkRole::Inbound, stream);
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!("Delivery channel closed");
                    break;
                }
            },
        };
        shared.on_delivery(delivery);
    }
    debug!("Dispatch loop stopped");
}
