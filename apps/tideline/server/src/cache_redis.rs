use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use tideline_core::{subscription_keys, ConnectionId, TopicCache};
use tracing::warn;

/// Topic subscriptions in Redis, shared by every server and worker process.
///
/// Each connection owns `{prefix}:conn:{id}` (its key set and TTL, with a
/// matching `EX`). Each topic has a set `{prefix}:topic:{key}` of connection
/// ids. Topic sets are cleaned lazily: members whose connection key is gone
/// or no longer lists the topic are removed on lookup.
#[derive(Clone)]
pub struct RedisTopicCache {
    redis: ConnectionManager,
    prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSubscription {
    topics: Vec<String>,
    ttl_secs: u64,
}

impl RedisTopicCache {
    pub async fn connect(url: &str, prefix: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            prefix: prefix.to_string(),
        })
    }

    fn connection_key(&self, connection: &str) -> String {
        format!("{}:conn:{}", self.prefix, connection)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.prefix, topic)
    }

    async fn load(&self, connection: &ConnectionId) -> Option<StoredSubscription> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = match conn.get(self.connection_key(connection.as_str())).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "failed to read subscription");
                return None;
            }
        };
        raw.and_then(|raw| serde_json::from_str(&raw).ok())
    }
}

#[async_trait]
impl TopicCache for RedisTopicCache {
    async fn set_topics(
        &self,
        connection: &ConnectionId,
        user_id: Option<&str>,
        topics: &[String],
        ttl: Duration,
    ) {
        let stored = StoredSubscription {
            topics: subscription_keys(connection, user_id, topics)
                .into_iter()
                .collect(),
            ttl_secs: ttl.as_secs().max(1),
        };
        let payload = match serde_json::to_string(&stored) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "failed to encode subscription");
                return;
            }
        };

        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(self.connection_key(connection.as_str()))
            .arg(payload)
            .arg("EX")
            .arg(stored.ttl_secs)
            .ignore();
        for topic in &stored.topics {
            let key = self.topic_key(topic);
            pipe.cmd("SADD").arg(&key).arg(connection.as_str()).ignore();
            pipe.cmd("EXPIRE").arg(&key).arg(stored.ttl_secs).ignore();
        }
        let mut conn = self.redis.clone();
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(connection_id = %connection, error = %err, "failed to store subscription");
        }
    }

    async fn get_connections_for_topic(&self, topic: &str) -> HashSet<ConnectionId> {
        let mut conn = self.redis.clone();
        let topic_key = self.topic_key(topic);
        let members: Vec<String> = match conn.smembers(&topic_key).await {
            Ok(members) => members,
            Err(err) => {
                warn!(topic, error = %err, "failed to read topic members");
                return HashSet::new();
            }
        };
        if members.is_empty() {
            return HashSet::new();
        }

        let keys: Vec<String> = members
            .iter()
            .map(|member| self.connection_key(member))
            .collect();
        let stored: Vec<Option<String>> = match redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                warn!(topic, error = %err, "failed to read subscriptions");
                return HashSet::new();
            }
        };

        let mut live = HashSet::new();
        let mut stale = Vec::new();
        for (member, raw) in members.into_iter().zip(stored) {
            let subscribed = raw
                .and_then(|raw| serde_json::from_str::<StoredSubscription>(&raw).ok())
                .is_some_and(|subscription| subscription.topics.iter().any(|key| key == topic));
            if subscribed {
                live.insert(ConnectionId::new(member));
            } else {
                stale.push(member);
            }
        }
        if !stale.is_empty() {
            if let Err(err) = conn.srem::<_, _, ()>(&topic_key, stale).await {
                warn!(topic, error = %err, "failed to prune stale topic members");
            }
        }
        live
    }

    async fn touch(&self, connection: &ConnectionId) {
        let Some(stored) = self.load(connection).await else {
            return;
        };
        let ttl = stored.ttl_secs as i64;
        let mut pipe = redis::pipe();
        pipe.cmd("EXPIRE")
            .arg(self.connection_key(connection.as_str()))
            .arg(ttl)
            .ignore();
        for topic in &stored.topics {
            pipe.cmd("EXPIRE").arg(self.topic_key(topic)).arg(ttl).ignore();
        }
        let mut conn = self.redis.clone();
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(connection_id = %connection, error = %err, "failed to refresh subscription");
        }
    }

    async fn invalidate(&self, connection: &ConnectionId) {
        let stored = self.load(connection).await;
        let mut pipe = redis::pipe();
        pipe.cmd("DEL")
            .arg(self.connection_key(connection.as_str()))
            .ignore();
        for topic in stored.iter().flat_map(|stored| stored.topics.iter()) {
            pipe.cmd("SREM")
                .arg(self.topic_key(topic))
                .arg(connection.as_str())
                .ignore();
        }
        let mut conn = self.redis.clone();
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(connection_id = %connection, error = %err, "failed to drop subscription");
        }
    }

    async fn topics_for(&self, connection: &ConnectionId) -> Option<Vec<String>> {
        self.load(connection).await.map(|stored| stored.topics)
    }
}
