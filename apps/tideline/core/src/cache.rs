use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::gauge;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::context::ConnectionId;
use crate::topic::{user_topic, window_topic, BROADCAST_TOPIC};

/// Topic subscriptions per connection, with expiry.
///
/// Implementations are eventually consistent: a lookup racing a
/// `set_topics` may see either the old or the new set. Reads never return a
/// connection whose entry has expired.
#[async_trait]
pub trait TopicCache: Send + Sync {
    /// Replaces the connection's topic set and resets its expiry. The window
    /// and user identity keys are added implicitly.
    async fn set_topics(
        &self,
        connection: &ConnectionId,
        user_id: Option<&str>,
        topics: &[String],
        ttl: Duration,
    );

    async fn get_connections_for_topic(&self, topic: &str) -> HashSet<ConnectionId>;

    /// Extends a live entry by its own TTL. Expired or unknown entries are
    /// left alone.
    async fn touch(&self, connection: &ConnectionId);

    async fn invalidate(&self, connection: &ConnectionId);

    /// Keys of a live entry, sorted.
    async fn topics_for(&self, connection: &ConnectionId) -> Option<Vec<String>>;
}

/// The full key set stored for a connection.
pub fn subscription_keys(
    connection: &ConnectionId,
    user_id: Option<&str>,
    topics: &[String],
) -> BTreeSet<String> {
    let mut keys: BTreeSet<String> = topics.iter().cloned().collect();
    keys.insert(window_topic(connection));
    keys.insert(BROADCAST_TOPIC.to_string());
    if let Some(user_id) = user_id {
        keys.insert(user_topic(user_id));
    }
    keys
}

#[derive(Clone, Default)]
pub struct MemoryTopicCache {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: DashMap<ConnectionId, Subscription>,
    index: DashMap<String, HashSet<ConnectionId>>,
}

struct Subscription {
    topics: BTreeSet<String>,
    ttl: Duration,
    expires_at: Instant,
}

impl Subscription {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryTopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry and its index references.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .inner
            .entries
            .iter()
            .filter(|entry| !entry.is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0usize;
        for connection in expired {
            if let Some((_, subscription)) = self
                .inner
                .entries
                .remove_if(&connection, |_, subscription| !subscription.is_live(now))
            {
                self.unindex(&connection, &subscription.topics);
                removed += 1;
            }
        }
        gauge!("tideline_topic_cache_entries", self.inner.entries.len() as f64);
        removed
    }

    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        let mut interval = tokio::time::interval(period);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired topic subscriptions");
                }
            }
        })
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unindex<'a>(&self, connection: &ConnectionId, topics: impl IntoIterator<Item = &'a String>) {
        for topic in topics {
            let now_empty = match self.inner.index.get_mut(topic) {
                Some(mut members) => {
                    members.remove(connection);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.inner.index.remove_if(topic, |_, members| members.is_empty());
            }
        }
    }
}

#[async_trait]
impl TopicCache for MemoryTopicCache {
    async fn set_topics(
        &self,
        connection: &ConnectionId,
        user_id: Option<&str>,
        topics: &[String],
        ttl: Duration,
    ) {
        let keys = subscription_keys(connection, user_id, topics);
        for key in &keys {
            self.inner
                .index
                .entry(key.clone())
                .or_default()
                .insert(connection.clone());
        }

        let previous = self.inner.entries.insert(
            connection.clone(),
            Subscription {
                topics: keys.clone(),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        if let Some(previous) = previous {
            self.unindex(connection, previous.topics.difference(&keys));
        }
    }

    async fn get_connections_for_topic(&self, topic: &str) -> HashSet<ConnectionId> {
        let candidates: Vec<ConnectionId> = match self.inner.index.get(topic) {
            Some(members) => members.iter().cloned().collect(),
            None => return HashSet::new(),
        };
        let now = Instant::now();
        candidates
            .into_iter()
            .filter(|connection| {
                self.inner
                    .entries
                    .get(connection)
                    .is_some_and(|entry| entry.is_live(now) && entry.topics.contains(topic))
            })
            .collect()
    }

    async fn touch(&self, connection: &ConnectionId) {
        let now = Instant::now();
        if let Some(mut entry) = self.inner.entries.get_mut(connection) {
            if entry.is_live(now) {
                entry.expires_at = now + entry.ttl;
            }
        }
    }

    async fn invalidate(&self, connection: &ConnectionId) {
        if let Some((_, subscription)) = self.inner.entries.remove(connection) {
            self.unindex(connection, &subscription.topics);
        }
    }

    async fn topics_for(&self, connection: &ConnectionId) -> Option<Vec<String>> {
        let now = Instant::now();
        self.inner
            .entries
            .get(connection)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.topics.iter().cloned().collect())
    }
}
