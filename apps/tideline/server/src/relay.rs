use anyhow::{Context, Result};
use futures_util::StreamExt;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tideline_core::{ConnectionId, Delivery, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::multiplexer::ConnectionMultiplexer;

/// A push addressed to whichever server process holds the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum RelayEnvelope {
    Connection {
        connection_id: ConnectionId,
        message: SignalMessage,
    },
    User {
        user_id: String,
        message: SignalMessage,
    },
    All {
        message: SignalMessage,
    },
}

impl RelayEnvelope {
    /// Delivers the envelope to the connections this process holds.
    pub fn deliver(&self, local: &impl Delivery) -> usize {
        match self {
            RelayEnvelope::Connection {
                connection_id,
                message,
            } => usize::from(local.push(connection_id, message)),
            RelayEnvelope::User { user_id, message } => local.push_user(user_id, message),
            RelayEnvelope::All { message } => local.push_all(message),
        }
    }
}

pub fn relay_channel(prefix: &str) -> String {
    format!("{prefix}:relay")
}

/// Publishes pushes on a Redis channel so that handlers running in a worker
/// process reach sockets held by the server processes. The counts returned
/// by the [`Delivery`] methods are envelopes published, not frames delivered.
#[derive(Clone)]
pub struct RedisRelay {
    tx: mpsc::UnboundedSender<RelayEnvelope>,
}

impl RedisRelay {
    /// Starts the publisher task. It ends once every relay handle is dropped.
    pub fn spawn(redis: ConnectionManager, prefix: &str) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayEnvelope>();
        let channel = relay_channel(prefix);
        let handle = tokio::spawn(async move {
            let mut conn = redis;
            while let Some(envelope) = rx.recv().await {
                let payload = match serde_json::to_string(&envelope) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "failed to encode relay envelope");
                        continue;
                    }
                };
                match conn.publish::<_, _, i64>(&channel, payload).await {
                    Ok(_) => counter!("tideline_relay_published_total", 1),
                    Err(err) => warn!(error = %err, "failed to publish relay envelope"),
                }
            }
            debug!("relay publisher stopped");
        });
        (Self { tx }, handle)
    }

    fn publish(&self, envelope: RelayEnvelope) -> usize {
        usize::from(self.tx.send(envelope).is_ok())
    }
}

impl Delivery for RedisRelay {
    fn push(&self, connection: &ConnectionId, message: &SignalMessage) -> bool {
        self.publish(RelayEnvelope::Connection {
            connection_id: connection.clone(),
            message: message.clone(),
        }) == 1
    }

    fn push_user(&self, user_id: &str, message: &SignalMessage) -> usize {
        self.publish(RelayEnvelope::User {
            user_id: user_id.to_string(),
            message: message.clone(),
        })
    }

    fn push_all(&self, message: &SignalMessage) -> usize {
        self.publish(RelayEnvelope::All {
            message: message.clone(),
        })
    }
}

/// Subscribes to the relay channel and hands every envelope to the local
/// multiplexer.
pub async fn spawn_listener(
    url: &str,
    prefix: &str,
    multiplexer: ConnectionMultiplexer,
) -> Result<JoinHandle<()>> {
    let client = redis::Client::open(url).context("failed to create redis client")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to open redis pubsub connection")?;
    let channel = relay_channel(prefix);
    pubsub
        .subscribe(&channel)
        .await
        .with_context(|| format!("failed to subscribe to {channel}"))?;
    info!(channel = %channel, "relay listener subscribed");

    Ok(tokio::spawn(async move {
        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "relay payload is not a string");
                    continue;
                }
            };
            match serde_json::from_str::<RelayEnvelope>(&payload) {
                Ok(envelope) => {
                    let delivered = envelope.deliver(&multiplexer);
                    counter!("tideline_relay_delivered_total", delivered as u64);
                }
                Err(err) => warn!(error = %err, "discarding malformed relay envelope"),
            }
        }
        warn!("relay listener stream ended");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tideline_core::{args, MemoryTopicCache};

    use crate::multiplexer::MultiplexerConfig;

    #[test]
    fn envelopes_are_tagged() {
        let envelope = RelayEnvelope::User {
            user_id: "7".into(),
            message: SignalMessage::new("notice", args(serde_json::json!({"n": 1}))),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["to"], "user");
        assert_eq!(value["user_id"], "7");
        assert_eq!(value["message"]["signal"], "notice");

        let back: RelayEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[tokio::test]
    async fn envelopes_reach_local_connections() {
        let mux = ConnectionMultiplexer::new(
            Arc::new(MemoryTopicCache::new()),
            MultiplexerConfig::default(),
        );
        let mut alice = mux.open(&"a1".into(), Some("alice"));
        let _bob = mux.open(&"b1".into(), Some("bob"));
        let message = SignalMessage::new("hello", args(serde_json::json!({})));

        let direct = RelayEnvelope::Connection {
            connection_id: "a1".into(),
            message: message.clone(),
        };
        assert_eq!(direct.deliver(&mux), 1);
        assert_eq!(
            RelayEnvelope::User {
                user_id: "alice".into(),
                message: message.clone()
            }
            .deliver(&mux),
            1
        );
        assert_eq!(RelayEnvelope::All { message }.deliver(&mux), 2);
        assert!(alice.receiver.recv().await.is_some());
    }
}
