// Mesh Relay Core: store-and-forward envelope relay
//
// Every connected peer gets one Link with its own ordered outbound queue.
// A relay server rebroadcasts each envelope to every other Link; a bridge
// keeps one upstream Link for a local producer. Sockets fail and come back;
// queued envelopes stay put and go out in order once they do.

pub mod link;
pub mod message;
pub mod relay;

pub use link::{
    Delivery, Link, LinkConfig, LinkError, LinkRegistry, LinkRole, LinkState, LinkStats, PeerKey,
};
pub use message::{Envelope, EnvelopeBuilder, MessageIdGenerator, WireError};
pub use relay::{
    parse_peer_list, Bridge, BridgeConfig, BridgeStats, EnvelopeHandler, PeerAddr, PeerKeyStrategy, ReconnectPolicy,
    RelayError, RelayServer, RelayServerConfig, RelayServerStats, DEFAULT_RELAY_PORT,
};
