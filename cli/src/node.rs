// A running relay or bridge, as seen by the console and the generator

use anyhow::Result;
use meshrelay_core::{Bridge, Envelope, MessageIdGenerator, RelayServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Group used for generator traffic
pub const DEFAULT_GROUP: &str = "grp";

/// Group for files added from the console; the bridge logs each one it sends
pub const FILE_GROUP: &str = "sigactgrp";

const GENERATOR_METADATA: &str = "<xml>\n\t<Metadata>\n\t</Metadata>\n</xml>";

pub enum Node {
    Relay {
        server: RelayServer,
        ids: MessageIdGenerator,
    },
    Bridge(Bridge),
}

impl Node {
    pub fn relay(server: RelayServer, node_id: impl Into<String>) -> Self {
        Node::Relay {
            server,
            ids: MessageIdGenerator::new(node_id),
        }
    }

    /// Inject a locally produced message; returns its id
    pub fn add_message(
        &self,
        group: &str,
        object_id: &str,
        instance_id: &str,
        metadata: &str,
        payload: Vec<u8>,
    ) -> String {
        match self {
            Node::Relay { server, ids } => {
                let id = ids.next_id(group);
                let envelope = Envelope::builder(id.clone(), group)
                    .object_id(object_id)
                    .instance_id(instance_id)
                    .metadata(metadata)
                    .payload(payload)
                    .build();
                let links = server.publish(envelope);
                debug!(id = %id, links, "Published local message");
                id
            }
            Node::Bridge(bridge) => {
                bridge.add_message(group, object_id, instance_id, metadata, payload, 0)
            }
        }
    }

    pub fn stats_json(&self) -> Result<String> {
        let json = match self {
            Node::Relay { server, .. } => serde_json::to_string_pretty(&server.get_stats())?,
            Node::Bridge(bridge) => serde_json::to_string_pretty(&bridge.get_stats())?,
        };
        Ok(json)
    }

    pub async fn shutdown(&self) {
        match self {
            Node::Relay { server, .. } => server.shutdown().await,
            Node::Bridge(bridge) => bridge.shutdown().await,
        }
    }
}

/// Publish one synthetic message every `period` until aborted
pub fn spawn_generator(node: Arc<Node>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            node.add_message(DEFAULT_GROUP, "objId", "instId", GENERATOR_METADATA, Vec::new());
        }
    })
}
