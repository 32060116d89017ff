//! Link registry: the one place Links are created, rebound and enumerated
//!
//! One mutex guards the whole map. Insert/rebind and fan-out iteration both
//! take it, so an enqueue can never land on a half-rebound Link.

use super::session::{BoxedReader, BoxedWriter};
use super::{Delivery, Link, LinkConfig, LinkRole, LinkStats, PeerKey};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owned set of Links keyed by peer.
///
/// Every Link's receiver reports into a single delivery channel; whoever
/// owns the registry (a relay server or a bridge) takes that channel once
/// with [`LinkRegistry::take_deliveries`].
pub struct LinkRegistry {
    config: LinkConfig,
    links: Mutex<HashMap<PeerKey, Arc<Link>>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LinkRegistry {
    /// Create an empty registry with default link settings
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        let (deliveries, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            links: Mutex::new(HashMap::new()),
            deliveries,
            inbox: Mutex::new(Some(inbox)),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Take the stream of inbound envelopes. Only the first call gets it.
    pub fn take_deliveries(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.inbox.lock().take()
    }

    /// Look up `peer_key`, creating a Link if absent, and bind `stream` to it.
    ///
    /// An existing Link keeps its identity and its outbound queue; only its
    /// socket is replaced. Concurrent calls for the same key yield the same
    /// Link and never start a second pair of tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_or_create<S>(&self, peer_key: PeerKey, role: LinkRole, stream: S) -> Arc<Link>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.bind(peer_key, role, Some((Box::new(reader), Box::new(writer))))
    }

    /// Look up `peer_key`, creating a detached Link (state `Connecting`) if absent
    pub fn ensure(&self, peer_key: PeerKey, role: LinkRole) -> Arc<Link> {
        self.bind(peer_key, role, None)
    }

    fn bind(&self, peer_key: PeerKey, role: LinkRole, socket: Option<(BoxedReader, BoxedWriter)>) -> Arc<Link> {
        let mut links = self.links.lock();

        if let Some(link) = links.get(&peer_key) {
            let link = Arc::clone(link);
            if let Some((reader, writer)) = socket {
                link.attach(reader, writer);
            }
            return link;
        }

        let (link, attachments) = Link::new(peer_key.clone(), role, self.config.clone());
        let handles = link.spawn_tasks(attachments, self.deliveries.clone(), &self.cancel);
        self.tasks.lock().extend(handles);

        if let Some((reader, writer)) = socket {
            link.attach(reader, writer);
        }

        debug!(peer = %peer_key, role = ?role, "Registered link");
        links.insert(peer_key, Arc::clone(&link));
        link
    }

    /// Run `f` on every Link except `excluded`, under the registry lock.
    ///
    /// Returns how many Links were visited.
    pub fn for_each_except<F>(&self, excluded: Option<&PeerKey>, mut f: F) -> usize
    where
        F: FnMut(&Arc<Link>),
    {
        let links = self.links.lock();
        let mut visited = 0;
        for (key, link) in links.iter() {
            if Some(key) == excluded {
                continue;
            }
            f(link);
            visited += 1;
        }
        visited
    }

    pub fn get(&self, peer_key: &PeerKey) -> Option<Arc<Link>> {
        self.links.lock().get(peer_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Registered peer keys, sorted
    pub fn peer_keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self.links.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stats for every Link, sorted by peer key
    pub fn link_stats(&self) -> Vec<LinkStats> {
        let mut stats: Vec<LinkStats> = self.links.lock().values().map(|l| l.stats()).collect();
        stats.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
        stats
    }

    /// Link tasks started and not yet joined by `shutdown` (two per Link)
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop every Link's tasks and wait for them. Sockets are closed as the
    /// tasks drop them; queued envelopes stay where they are.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                debug!("Link task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
