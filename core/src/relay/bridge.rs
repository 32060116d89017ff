//! Bridge: one always-reconnecting upstream link for a local producer
//!
//! The bridge never fans out. Envelopes a producer hands it are queued on
//! the single upstream Link; envelopes arriving from upstream go to the
//! installed handler.

use super::addr::PeerAddr;
use super::dialer::{supervise_outbound, ReconnectPolicy};
use super::handler::{EnvelopeHandler, HandlerSlot};
use super::RelayError;
use crate::link::{Delivery, Link, LinkRegistry, LinkRole, LinkState, LinkStats};
use crate::message::{Envelope, MessageIdGenerator};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Application id used when none is given
pub const DEFAULT_APPLICATION_ID: u16 = 3;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The one peer this bridge forwards to
    pub upstream: PeerAddr,
    /// Node id embedded in generated message ids
    pub node_id: String,
    /// Delay between re-dials of the upstream
    pub reconnect: ReconnectPolicy,
}

impl BridgeConfig {
    pub fn new(upstream: PeerAddr) -> Self {
        Self::for_application(upstream, DEFAULT_APPLICATION_ID)
    }

    pub fn for_application(upstream: PeerAddr, application_id: u16) -> Self {
        Self {
            upstream,
            node_id: format!("bridge-{}", application_id),
            reconnect: ReconnectPolicy::BRIDGE_DEFAULT,
        }
    }
}

/// Statistics about bridge operations
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub upstream: String,
    pub node_id: String,
    pub initialized: bool,
    /// Envelopes received from upstream
    pub envelopes_received: u64,
    /// Received envelopes with no handler installed
    pub envelopes_unhandled: u64,
    pub link: LinkStats,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    unhandled: AtomicU64,
}

pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<LinkRegistry>,
    link: Arc<Link>,
    ids: MessageIdGenerator,
    handler: Arc<HandlerSlot>,
    counters: Arc<Counters>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Create a bridge owning `registry`; the upstream Link exists (and
    /// accepts envelopes) before `start` is called.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BridgeConfig, registry: Arc<LinkRegistry>) -> Result<Self, RelayError> {
        let deliveries = registry.take_deliveries().ok_or(RelayError::RegistryInUse)?;
        let link = registry.ensure(config.upstream.peer_key(), LinkRole::Outbound);
        let ids = MessageIdGenerator::new(config.node_id.clone());

        Ok(Self {
            config,
            registry,
            link,
            ids,
            handler: Arc::new(HandlerSlot::default()),
            counters: Arc::new(Counters::default()),
            deliveries: Mutex::new(Some(deliveries)),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Install a local consumer for envelopes arriving from upstream
    pub fn with_handler(self, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn set_handler(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.handler.set(handler);
    }

    /// Start dialing the upstream and dispatching what it sends
    pub fn start(&self) -> Result<(), RelayError> {
        let deliveries = self
            .deliveries
            .lock()
            .take()
            .ok_or(RelayError::AlreadyStarted)?;
        info!(
            "Bridge {} forwarding to {}",
            self.config.node_id, self.config.upstream
        );

        let supervisor = tokio::spawn(supervise_outbound(
            Arc::clone(&self.registry),
            self.config.upstream.clone(),
            self.config.reconnect,
            self.cancel.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.handler),
            Arc::clone(&self.counters),
            deliveries,
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([supervisor, dispatch]);
        Ok(())
    }

    /// Queue `envelope` for upstream. Never blocks, never fails.
    pub fn enqueue(&self, envelope: Envelope) {
        self.link.enqueue(envelope);
    }

    /// Build an envelope with a freshly generated id, queue it, and return
    /// the id
    pub fn add_message(
        &self,
        group: &str,
        object_id: &str,
        instance_id: &str,
        metadata: &str,
        payload: impl Into<Vec<u8>>,
        expiration: i64,
    ) -> String {
        let id = self.ids.next_id(group);
        let envelope = Envelope::builder(id.clone(), group)
            .object_id(object_id)
            .instance_id(instance_id)
            .metadata(metadata)
            .payload(payload)
            .expiration(expiration)
            .build();
        debug!(id = %id, "Queued local message");
        self.enqueue(envelope);
        id
    }

    /// `true` while the upstream socket is live
    pub fn is_initialized(&self) -> bool {
        self.link.state() == LinkState::Active
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.ids.node_id()
    }

    pub fn get_stats(&self) -> BridgeStats {
        BridgeStats {
            upstream: self.config.upstream.to_string(),
            node_id: self.config.node_id.clone(),
            initialized: self.is_initialized(),
            envelopes_received: self.counters.received.load(Ordering::Relaxed),
            envelopes_unhandled: self.counters.unhandled.load(Ordering::Relaxed),
            link: self.link.stats(),
        }
    }

    /// Stop dialing and dispatching, then stop the upstream Link.
    ///
    /// Envelopes still queued stay visible through `get_stats`.
    pub async fn shutdown(&self) {
        info!("Bridge {} shutting down", self.config.node_id);
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        join_all(handles).await;
        self.registry.shutdown().await;
    }
}

async fn dispatch_loop(
    handler: Arc<HandlerSlot>,
    counters: Arc<Counters>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        counters.received.fetch_add(1, Ordering::Relaxed);
        let id = delivery.envelope.id().to_string();
        if !handler.deliver(delivery.envelope, &delivery.from) {
            counters.unhandled.fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, "No handler for upstream envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PeerKey;
    use crate::message::{read_frame, write_frame, FrameRead, DEFAULT_MAX_FRAME_LEN};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn recv(stream: &mut TcpStream) -> Envelope {
        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .expect("no frame arrived")
        .unwrap();
        match frame {
            FrameRead::Envelope(env) => env,
            FrameRead::Malformed(e) => panic!("malformed frame: {e}"),
        }
    }

    async fn upstream() -> (TcpListener, PeerAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PeerAddr::new("127.0.0.1", port))
    }

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::new(PeerAddr::new("relay", 56487));
        assert_eq!(config.node_id, "bridge-3");
        assert_eq!(config.reconnect, ReconnectPolicy::Fixed(Duration::from_millis(500)));

        let config = BridgeConfig::for_application(PeerAddr::new("relay", 1), 9);
        assert_eq!(config.node_id, "bridge-9");
    }

    #[tokio::test]
    async fn test_enqueue_before_start_is_accepted() {
        let bridge = Bridge::new(
            BridgeConfig::new(PeerAddr::new("127.0.0.1", 1)),
            Arc::new(LinkRegistry::new()),
        )
        .unwrap();

        bridge.enqueue(Envelope::builder("e1", "grp").build());
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.state(), LinkState::Connecting);
        assert_eq!(bridge.get_stats().link.queue_depth, 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_message_generates_ids() {
        let (listener, addr) = upstream().await;
        let bridge = Bridge::new(BridgeConfig::new(addr), Arc::new(LinkRegistry::new())).unwrap();
        bridge.start().unwrap();

        let first = bridge.add_message("grp", "objId", "instId", "meta", b"one".to_vec(), 0);
        let second = bridge.add_message("grp", "objId", "instId", "", b"two".to_vec(), 42);
        assert_eq!(first, "grp:bridge-3:0");
        assert_eq!(second, "grp:bridge-3:1");

        let (mut conn, _) = listener.accept().await.unwrap();
        let got = recv(&mut conn).await;
        assert_eq!(got.id(), first);
        assert_eq!(got.object_id(), "objId");
        assert_eq!(got.instance_id(), "instId");
        assert_eq!(got.metadata(), "meta");
        assert_eq!(got.payload(), b"one");

        let got = recv(&mut conn).await;
        assert_eq!(got.id(), second);
        assert_eq!(got.expiration(), 42);

        bridge.link().wait_active().await;
        assert!(bridge.is_initialized());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_upstream_envelopes_reach_handler() {
        let (listener, addr) = upstream().await;
        let key = addr.peer_key();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |env: Envelope, from: &PeerKey| {
            let _ = tx.send((env.id().to_string(), from.clone()));
        };

        let bridge = Bridge::new(BridgeConfig::new(addr), Arc::new(LinkRegistry::new()))
            .unwrap()
            .with_handler(Arc::new(handler));
        bridge.start().unwrap();

        let (mut conn, _) = listener.accept().await.unwrap();
        write_frame(&mut conn, &Envelope::builder("down-1", "grp").build())
            .await
            .unwrap();

        let (id, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "down-1");
        assert_eq!(from, key);
        assert_eq!(bridge.get_stats().envelopes_received, 1);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_listener, addr) = upstream().await;
        let bridge = Bridge::new(BridgeConfig::new(addr), Arc::new(LinkRegistry::new())).unwrap();
        bridge.start().unwrap();
        assert!(matches!(bridge.start(), Err(RelayError::AlreadyStarted)));
        bridge.shutdown().await;
    }
}
