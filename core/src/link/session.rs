//! Link session: socket lifecycle plus the sender and receiver tasks
//!
//! Every attached socket gets a generation number. Each task only trusts a
//! socket half while its generation is the current one *and* the link is
//! `Active`; anything else is a stale socket and gets dropped (closed).

use super::{Delivery, LinkConfig, LinkError, LinkRole, LinkState, OutboundQueue, PeerKey};
use crate::message::{read_frame, write_frame_limited, Envelope, FrameRead};
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A socket half tagged with the generation it belongs to
struct Attached<T> {
    generation: u64,
    half: T,
}

/// Receiving ends of the per-link attachment channels, handed to the tasks
pub(crate) struct Attachments {
    readers: mpsc::UnboundedReceiver<Attached<BoxedReader>>,
    writers: mpsc::UnboundedReceiver<Attached<BoxedWriter>>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time view of one link
#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    pub peer_key: PeerKey,
    pub role: LinkRole,
    pub state: LinkState,
    /// Envelopes waiting in the outbound queue
    pub queue_depth: usize,
    /// Envelopes written to a socket
    pub sent: u64,
    /// Envelopes read from a socket
    pub received: u64,
    /// Inbound frames dropped because they could not be decoded
    pub malformed: u64,
    /// Outbound envelopes dropped because they could not be encoded
    pub dropped: u64,
    /// Sockets attached after the first one
    pub reconnects: u64,
}

/// A managed connection to one peer
pub struct Link {
    peer_key: PeerKey,
    role: LinkRole,
    config: LinkConfig,
    queue: OutboundQueue,
    state: watch::Sender<LinkState>,
    generation: AtomicU64,
    readers: mpsc::UnboundedSender<Attached<BoxedReader>>,
    writers: mpsc::UnboundedSender<Attached<BoxedWriter>>,
    counters: Counters,
}

impl Link {
    /// Create a detached link in the `Connecting` state.
    ///
    /// Nothing runs until [`Link::spawn_tasks`] is called with the returned
    /// attachments.
    pub(crate) fn new(peer_key: PeerKey, role: LinkRole, config: LinkConfig) -> (Arc<Self>, Attachments) {
        let (readers, readers_rx) = mpsc::unbounded_channel();
        let (writers, writers_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Connecting);

        let link = Arc::new(Self {
            peer_key,
            role,
            config,
            queue: OutboundQueue::new(),
            state,
            generation: AtomicU64::new(0),
            readers,
            writers,
            counters: Counters::default(),
        });

        (
            link,
            Attachments {
                readers: readers_rx,
                writers: writers_rx,
            },
        )
    }

    /// Start the sender and receiver tasks
    pub(crate) fn spawn_tasks(
        self: &Arc<Self>,
        attachments: Attachments,
        deliveries: mpsc::UnboundedSender<Delivery>,
        cancel: &CancellationToken,
    ) -> [JoinHandle<()>; 2] {
        let sender = tokio::spawn(Arc::clone(self).run_sender(attachments.writers, cancel.clone()));
        let receiver = tokio::spawn(Arc::clone(self).run_receiver(
            attachments.readers,
            deliveries,
            cancel.clone(),
        ));
        [sender, receiver]
    }

    pub fn peer_key(&self) -> &PeerKey {
        &self.peer_key
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Number of sockets attached so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Queue an envelope for transmission. Never blocks, never fails.
    pub fn enqueue(&self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Ids still waiting to be sent, head first
    pub fn queued_ids(&self) -> Vec<String> {
        self.queue.ids()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            peer_key: self.peer_key.clone(),
            role: self.role,
            state: self.state(),
            queue_depth: self.queue.len(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Resolve once the link is `Active`
    pub async fn wait_active(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == LinkState::Active).await;
    }

    /// Resolve once the link has lost its socket
    pub async fn disconnected(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == LinkState::Reconnecting).await;
    }

    /// Bind a fresh socket to this link, superseding any previous one.
    ///
    /// Queued envelopes are kept; the sender resumes with the head of the
    /// queue on the new socket.
    pub(crate) fn attach(&self, reader: BoxedReader, writer: BoxedWriter) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.state.send_replace(LinkState::Active);

        let _ = self.readers.send(Attached {
            generation,
            half: reader,
        });
        let _ = self.writers.send(Attached {
            generation,
            half: writer,
        });

        if generation > 1 {
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }

        match previous {
            LinkState::Connecting => info!(peer = %self.peer_key, role = ?self.role, "Link connected"),
            LinkState::Reconnecting => info!(
                peer = %self.peer_key,
                generation,
                queued = self.queue.len(),
                "Link re-connected"
            ),
            LinkState::Active => info!(peer = %self.peer_key, generation, "Link socket replaced"),
        }
    }

    /// Report that the socket of `generation` failed.
    ///
    /// Ignored when a newer socket has already been attached.
    fn connection_lost(&self, generation: u64, reason: &dyn Display) {
        let changed = self.state.send_if_modified(|state| {
            if *state == LinkState::Active && self.generation.load(Ordering::SeqCst) == generation {
                *state = LinkState::Reconnecting;
                true
            } else {
                false
            }
        });

        if changed {
            warn!(
                peer = %self.peer_key,
                generation,
                queued = self.queue.len(),
                "Link disconnected: {}",
                reason
            );
        }
    }

    fn is_audited(&self, envelope: &Envelope) -> bool {
        self.config.audit_group.as_deref() == Some(envelope.group())
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation && *self.state.borrow() == LinkState::Active
    }

    async fn transmit(&self, writer: &mut BoxedWriter, envelope: &Envelope) -> Result<usize, LinkError> {
        let write = write_frame_limited(writer, envelope, self.config.max_frame_len);
        match self.config.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| LinkError::WriteTimeout(limit))?
                .map_err(LinkError::from),
            None => write.await.map_err(LinkError::from),
        }
    }

    // ========================================================================
    // SENDER TASK
    // ========================================================================

    async fn run_sender(
        self: Arc<Self>,
        mut writers: mpsc::UnboundedReceiver<Attached<BoxedWriter>>,
        cancel: CancellationToken,
    ) {
        let mut state = self.state.subscribe();
        let mut current: Option<Attached<BoxedWriter>> = None;

        loop {
            while let Ok(next) = writers.try_recv() {
                current = Some(next);
            }
            if let Some(attached) = &current {
                if !self.is_live(attached.generation) {
                    debug!(peer = %self.peer_key, generation = attached.generation, "Sender closing stale socket");
                    current = None;
                }
            }

            if current.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = writers.recv() => match next {
                        Some(next) => current = Some(next),
                        None => break,
                    },
                }
                continue;
            }

            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = writers.recv() => {
                    if let Some(next) = next {
                        current = Some(next);
                    }
                    continue;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                envelope = self.queue.pop() => envelope,
            };

            let Some(attached) = current.as_mut() else {
                self.queue.push_front(envelope);
                continue;
            };
            let generation = attached.generation;

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.push_front(envelope);
                    break;
                }
                result = self.transmit(&mut attached.half, &envelope) => result,
            };

            match result {
                Ok(bytes) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %self.peer_key, id = envelope.id(), bytes, "Envelope sent");
                    if self.is_audited(&envelope) {
                        info!(
                            sent_at_ms = unix_millis(),
                            id = envelope.id(),
                            object_id = envelope.object_id(),
                            instance_id = envelope.instance_id(),
                            "Sent {}",
                            envelope.group()
                        );
                    }
                }
                Err(err) if err.is_connection_failure() => {
                    // the failed envelope goes back to the head so order survives the reconnect
                    self.queue.push_front(envelope);
                    current = None;
                    self.connection_lost(generation, &err);
                }
                Err(err) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %self.peer_key, id = envelope.id(), "Dropping unsendable envelope: {}", err);
                }
            }
        }

        debug!(peer = %self.peer_key, "Sender stopped");
    }

    // ========================================================================
    // RECEIVER TASK
    // ========================================================================

    async fn run_receiver(
        self: Arc<Self>,
        mut readers: mpsc::UnboundedReceiver<Attached<BoxedReader>>,
        deliveries: mpsc::UnboundedSender<Delivery>,
        cancel: CancellationToken,
    ) {
        let mut state = self.state.subscribe();
        let mut current: Option<Attached<BoxedReader>> = None;

        loop {
            while let Ok(next) = readers.try_recv() {
                current = Some(next);
            }
            if let Some(attached) = &current {
                if !self.is_live(attached.generation) {
                    debug!(peer = %self.peer_key, generation = attached.generation, "Receiver closing stale socket");
                    current = None;
                }
            }

            let Some(attached) = current.as_mut() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = readers.recv() => match next {
                        Some(next) => current = Some(next),
                        None => break,
                    },
                }
                continue;
            };
            let generation = attached.generation;

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = readers.recv() => {
                    if let Some(next) = next {
                        current = Some(next);
                    }
                    continue;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                read = read_frame(&mut attached.half, self.config.max_frame_len) => read,
            };

            match read {
                Ok(FrameRead::Envelope(envelope)) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %self.peer_key, id = envelope.id(), group = envelope.group(), "Envelope received");
                    let delivery = Delivery {
                        from: self.peer_key.clone(),
                        envelope,
                    };
                    if deliveries.send(delivery).is_err() {
                        debug!(peer = %self.peer_key, "No consumer for inbound envelopes");
                    }
                }
                Ok(FrameRead::Malformed(err)) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %self.peer_key, "Dropping malformed frame: {}", err);
                }
                Err(err) => {
                    current = None;
                    self.connection_lost(generation, &err);
                }
            }
        }

        debug!(peer = %self.peer_key, "Receiver stopped");
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer_key", &self.peer_key)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("queue_depth", &self.queue.len())
            .finish()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================
