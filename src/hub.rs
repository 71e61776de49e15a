//! Fan-out to a peer's live connection (§4.F, §9 "cross-node fan-out").
//!
//! A connection is identified by a server-minted `connection_id`, never by
//! `session_id` — the dispatcher looks up the peer's current connection id
//! through the session registry / matchmaker and hands it to a [`Hub`] to
//! deliver. In local mode this is a direct channel send. In shared mode the
//! connection may live on another node, so delivery goes out over a pub/sub
//! channel and every node's subscriber loop forwards to its own local
//! connections — mirroring the "publish-to-channel with node-local
//! subscribers" design note rather than any direct RPC between nodes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// What a connection's writer task is told to do.
pub enum WsOutbound {
    Send(Message),
    Close,
}

pub type ConnectionSender = mpsc::UnboundedSender<WsOutbound>;

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a str,
    data: serde_json::Value,
}

fn encode(event: &str, data: serde_json::Value) -> String {
    serde_json::to_string(&OutboundEnvelope { event, data })
        .unwrap_or_else(|_| r#"{"event":"error","data":{"message":"internal encode error"}}"#.into())
}

#[async_trait]
pub trait Hub: Send + Sync {
    /// Registers the sender half of a freshly-accepted connection's writer
    /// task so it becomes reachable by `connection_id`.
    fn register(&self, connection_id: String, sender: ConnectionSender);

    /// Removes a connection once its task has exited. Safe to call more
    /// than once.
    fn unregister(&self, connection_id: &str);

    async fn send(&self, connection_id: &str, event: &str, data: serde_json::Value);

    async fn close(&self, connection_id: &str);
}

/// Single-process hub: every connection this server holds is reachable
/// directly through an in-memory map.
pub struct LocalHub {
    connections: DashMap<String, ConnectionSender>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hub for LocalHub {
    fn register(&self, connection_id: String, sender: ConnectionSender) {
        self.connections.insert(connection_id, sender);
    }

    fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    async fn send(&self, connection_id: &str, event: &str, data: serde_json::Value) {
        if let Some(tx) = self.connections.get(connection_id) {
            let text = encode(event, data);
            if tx.send(WsOutbound::Send(Message::Text(text.into()))).is_err() {
                debug!(connection_id, "peer writer task gone; dropping event");
            }
        }
    }

    async fn close(&self, connection_id: &str) {
        if let Some(tx) = self.connections.get(connection_id) {
            let _ = tx.send(WsOutbound::Close);
        }
    }
}

#[derive(Serialize, serde::Deserialize)]
struct FanoutMessage {
    connection_id: String,
    event: String,
    data: serde_json::Value,
    close: bool,
}

const FANOUT_CHANNEL: &str = "relay:fanout";

/// Multi-node hub: local connections are served directly; everything else
/// goes out over a Redis pub/sub channel that every node in the fleet
/// subscribes to.
pub struct RedisHub {
    local: LocalHub,
    client: redis::Client,
}

impl RedisHub {
    pub fn new(client: redis::Client) -> Arc<Self> {
        let hub = Arc::new(Self {
            local: LocalHub::new(),
            client,
        });
        hub.clone().spawn_subscriber();
        hub
    }

    fn spawn_subscriber(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                match self.client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(FANOUT_CHANNEL).await {
                            warn!(error = %e, "failed to subscribe to fanout channel, retrying");
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        use futures_util::StreamExt;
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            let Ok(fanout) = serde_json::from_str::<FanoutMessage>(&payload) else {
                                continue;
                            };
                            if fanout.close {
                                self.local.close(&fanout.connection_id).await;
                            } else {
                                self.local
                                    .send(&fanout.connection_id, &fanout.event, fanout.data)
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "fanout subscriber connection lost, retrying");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    async fn publish(&self, msg: &FanoutMessage) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            warn!("could not publish fanout message: no redis connection");
            return;
        };
        use redis::AsyncCommands;
        let payload = serde_json::to_string(msg).unwrap_or_default();
        let _: Result<(), _> = conn.publish(FANOUT_CHANNEL, payload).await;
    }
}

#[async_trait]
impl Hub for RedisHub {
    fn register(&self, connection_id: String, sender: ConnectionSender) {
        self.local.register(connection_id, sender);
    }

    fn unregister(&self, connection_id: &str) {
        self.local.unregister(connection_id);
    }

    async fn send(&self, connection_id: &str, event: &str, data: serde_json::Value) {
        if self.local.connections.contains_key(connection_id) {
            self.local.send(connection_id, event, data).await;
            return;
        }
        self.publish(&FanoutMessage {
            connection_id: connection_id.to_string(),
            event: event.to_string(),
            data,
            close: false,
        })
        .await;
    }

    async fn close(&self, connection_id: &str) {
        if self.local.connections.contains_key(connection_id) {
            self.local.close(connection_id).await;
            return;
        }
        self.publish(&FanoutMessage {
            connection_id: connection_id.to_string(),
            event: String::new(),
            data: serde_json::Value::Null,
            close: true,
        })
        .await;
    }
}
