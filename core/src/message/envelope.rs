// Envelope: the opaque, addressed unit exchanged between peers

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An immutable addressed envelope.
///
/// The relay never looks inside `metadata` or `payload`, and never
/// interprets `expiration`. Cloning is cheap: every clone shares the same
/// fields, so an envelope can be fanned out to many outbound queues
/// without copying the payload.
///
/// Two envelopes are equal when their ids are equal.
#[derive(Clone)]
pub struct Envelope {
    inner: Arc<Fields>,
}

struct Fields {
    id: String,
    group: String,
    object_id: String,
    instance_id: String,
    metadata: String,
    payload: Vec<u8>,
    expiration: i64,
}

impl Envelope {
    /// Start building an envelope with the two mandatory fields
    pub fn builder(id: impl Into<String>, group: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            id: id.into(),
            group: group.into(),
            object_id: String::new(),
            instance_id: String::new(),
            metadata: String::new(),
            payload: Vec::new(),
            expiration: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Logical channel / topic name
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn object_id(&self) -> &str {
        &self.inner.object_id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Opaque descriptive text, possibly empty
    pub fn metadata(&self) -> &str {
        &self.inner.metadata
    }

    /// Opaque binary content, possibly empty
    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Producer-supplied expiry hint
    pub fn expiration(&self) -> i64 {
        self.inner.expiration
    }

    /// Field-by-field comparison, unlike `==` which only compares ids
    pub fn same_content(&self, other: &Envelope) -> bool {
        let (a, b) = (&self.inner, &other.inner);
        Arc::ptr_eq(a, b)
            || (a.id == b.id
                && a.group == b.group
                && a.object_id == b.object_id
                && a.instance_id == b.instance_id
                && a.metadata == b.metadata
                && a.payload == b.payload
                && a.expiration == b.expiration)
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.inner.id)
            .field("group", &self.inner.group)
            .field("object_id", &self.inner.object_id)
            .field("instance_id", &self.inner.instance_id)
            .field("metadata_len", &self.inner.metadata.len())
            .field("payload_len", &self.inner.payload.len())
            .field("expiration", &self.inner.expiration)
            .finish()
    }
}

/// Builder for [`Envelope`]; every optional field defaults to empty / zero
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    id: String,
    group: String,
    object_id: String,
    instance_id: String,
    metadata: String,
    payload: Vec<u8>,
    expiration: i64,
}

impl EnvelopeBuilder {
    pub fn object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = object_id.into();
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn expiration(mut self, expiration: i64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            inner: Arc::new(Fields {
                id: self.id,
                group: self.group,
                object_id: self.object_id,
                instance_id: self.instance_id,
                metadata: self.metadata,
                payload: self.payload,
                expiration: self.expiration,
            }),
        }
    }
}

/// Issues producer-assigned envelope ids of the form `<group>:<node_id>:<seq>`.
///
/// The sequence is shared across groups and starts at zero.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_id: String,
    seq: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn next_id(&self, group: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", group, self.node_id, seq)
    }
}
