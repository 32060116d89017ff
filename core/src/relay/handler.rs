// Local consumer hook for received envelopes

use crate::link::PeerKey;
use crate::message::Envelope;
use parking_lot::RwLock;
use std::sync::Arc;

/// Receives every fresh envelope that arrives from a remote peer
#[cfg_attr(test, mockall::automock)]
pub trait EnvelopeHandler: Send + Sync {
    fn on_envelope(&self, envelope: Envelope, from: &PeerKey);
}

impl<F> EnvelopeHandler for F
where
    F: Fn(Envelope, &PeerKey) + Send + Sync,
{
    fn on_envelope(&self, envelope: Envelope, from: &PeerKey) {
        self(envelope, from)
    }
}

/// Optional handler shared between an owner and its dispatch task
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn EnvelopeHandler>>>,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handler: Arc<dyn EnvelopeHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Hand `envelope` to the handler; `false` if none is installed
    pub(crate) fn deliver(&self, envelope: Envelope, from: &PeerKey) -> bool {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler.on_envelope(envelope, from);
                true
            }
            None => false,
        }
    }
}
