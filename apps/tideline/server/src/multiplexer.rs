use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tideline_core::{ConnectionId, Delivery, SignalMessage, TopicCache};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub per_connection_buffer: usize,
    /// `None` keeps silent connections open forever.
    pub idle_timeout: Option<Duration>,
    pub recycle_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: None,
            recycle_interval: Duration::from_secs(30),
        }
    }
}

/// Live websocket connections by id and by user.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    users: DashMap<String, HashSet<ConnectionId>>,
    /// Generations dropped after a failed send whose socket task has not
    /// called `close` yet.
    evicted: DashMap<ConnectionId, u64>,
    topics: Arc<dyn TopicCache>,
    config: MultiplexerConfig,
    generation: AtomicU64,
}

struct ConnectionEntry {
    generation: u64,
    user_id: Option<String>,
    sender: mpsc::Sender<Message>,
    last_activity: AtomicU64,
}

/// Handed to the socket task that owns a freshly opened connection.
pub struct ConnectionRegistration {
    pub receiver: mpsc::Receiver<Message>,
    /// Identifies this registration when it is closed, so a stale socket
    /// cannot close a newer connection that reused its window key.
    pub generation: u64,
    pub active_connections: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub idle_ms: u64,
}

impl ConnectionMultiplexer {
    pub fn new(topics: Arc<dyn TopicCache>, config: MultiplexerConfig) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                connections: DashMap::new(),
                users: DashMap::new(),
                evicted: DashMap::new(),
                topics,
                config,
                generation: AtomicU64::new(1),
            }),
        }
    }

    /// Registers an open connection. A previous connection with the same id
    /// is replaced; its outbound channel closes and its socket task winds
    /// down on its own.
    pub fn open(&self, connection: &ConnectionId, user_id: Option<&str>) -> ConnectionRegistration {
        let (tx, rx) = mpsc::channel(self.inner.config.per_connection_buffer);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry {
            generation,
            user_id: user_id.map(str::to_string),
            sender: tx,
            last_activity: AtomicU64::new(now_millis()),
        };

        self.inner.evicted.remove(connection);
        if let Some(previous) = self.inner.connections.insert(connection.clone(), entry) {
            debug!(connection_id = %connection, "replacing connection with the same window key");
            if let Some(user) = previous.user_id {
                self.forget_user(&user, connection);
            }
        }
        if let Some(user_id) = user_id {
            self.inner
                .users
                .entry(user_id.to_string())
                .or_default()
                .insert(connection.clone());
        }

        let active_connections = self.inner.connections.len();
        counter!("tideline_connections_opened_total", 1);
        gauge!("tideline_active_connections", active_connections as f64);
        ConnectionRegistration {
            receiver: rx,
            generation,
            active_connections,
        }
    }

    /// Deregisters the connection and drops its topic subscriptions. Returns
    /// false when a newer connection has taken over the id, in which case
    /// nothing is touched.
    pub async fn close(&self, connection: &ConnectionId, generation: u64) -> bool {
        let removed = self
            .inner
            .connections
            .remove_if(connection, |_, entry| entry.generation == generation);
        match removed {
            Some((_, entry)) => {
                if let Some(user) = entry.user_id {
                    self.forget_user(&user, connection);
                }
            }
            None => {
                let was_evicted = self
                    .inner
                    .evicted
                    .remove_if(connection, |_, evicted| *evicted == generation)
                    .is_some();
                if !was_evicted {
                    return false;
                }
            }
        }
        self.inner.topics.invalidate(connection).await;
        gauge!("tideline_active_connections", self.inner.connections.len() as f64);
        true
    }

    pub fn record_activity(&self, connection: &ConnectionId) {
        if let Some(entry) = self.inner.connections.get(connection) {
            entry.last_activity.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn active_connections(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_open(&self, connection: &ConnectionId) -> bool {
        self.inner.connections.contains_key(connection)
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = now_millis();
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .inner
            .connections
            .iter()
            .map(|entry| ConnectionSnapshot {
                connection_id: entry.key().clone(),
                user_id: entry.user_id.clone(),
                idle_ms: now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)),
            })
            .collect();
        snapshots.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        snapshots
    }

    /// Sends a close frame to every connection idle for longer than the
    /// configured timeout and deregisters it.
    pub async fn force_close_idle(&self, now: u64) -> usize {
        let Some(timeout) = self.inner.config.idle_timeout else {
            return 0;
        };
        let idle: Vec<(ConnectionId, u64, mpsc::Sender<Message>)> = self
            .inner
            .connections
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity.load(Ordering::Relaxed))
                    > timeout.as_millis() as u64
            })
            .map(|entry| (entry.key().clone(), entry.generation, entry.sender.clone()))
            .collect();

        let mut closed = 0usize;
        for (connection, generation, sender) in idle {
            let _ = sender.try_send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::Owned("idle timeout".into()),
            })));
            if self.close(&connection, generation).await {
                counter!("tideline_idle_pruned_total", 1);
                info!(connection_id = %connection, "closed idle connection");
                closed += 1;
            }
        }
        closed
    }

    /// Starts the idle recycler when an idle timeout is configured.
    pub fn spawn_recycler(&self) -> Option<JoinHandle<()>> {
        self.inner.config.idle_timeout?;
        let multiplexer = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                let _ = multiplexer.force_close_idle(now_millis()).await;
            }
        }))
    }

    fn send_text(&self, connection: &ConnectionId, text: &str, outcome: &mut PushOutcome) {
        let Some(sender) = self
            .inner
            .connections
            .get(connection)
            .map(|entry| entry.sender.clone())
        else {
            return;
        };
        match sender.try_send(Message::Text(text.to_string())) {
            Ok(()) => outcome.delivered += 1,
            Err(TrySendError::Full(_)) => {
                outcome.dropped += 1;
                counter!("tideline_flow_control_drops_total", 1);
                warn!(connection_id = %connection, "outbound buffer full; frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                outcome.closed += 1;
                self.evict_closed(connection, &sender);
            }
        }
    }

    fn evict_closed(&self, connection: &ConnectionId, sender: &mpsc::Sender<Message>) {
        if let Some((_, entry)) = self
            .inner
            .connections
            .remove_if(connection, |_, entry| entry.sender.same_channel(sender))
        {
            if let Some(user) = entry.user_id {
                self.forget_user(&user, connection);
            }
            self.inner
                .evicted
                .insert(connection.clone(), entry.generation);
            debug!(connection_id = %connection, "evicted closed connection");
        }
    }

    fn forget_user(&self, user_id: &str, connection: &ConnectionId) {
        let now_empty = match self.inner.users.get_mut(user_id) {
            Some(mut connections) => {
                connections.remove(connection);
                connections.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.inner
                .users
                .remove_if(user_id, |_, connections| connections.is_empty());
        }
    }

    fn push_many(&self, targets: Vec<ConnectionId>, message: &SignalMessage) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let Some(text) = encode(message) else {
            return outcome;
        };
        for connection in &targets {
            self.send_text(connection, &text, &mut outcome);
        }
        outcome
    }
}

impl Delivery for ConnectionMultiplexer {
    fn push(&self, connection: &ConnectionId, message: &SignalMessage) -> bool {
        self.push_many(vec![connection.clone()], message).delivered == 1
    }

    fn push_user(&self, user_id: &str, message: &SignalMessage) -> usize {
        let targets: Vec<ConnectionId> = self
            .inner
            .users
            .get(user_id)
            .map(|connections| connections.iter().cloned().collect())
            .unwrap_or_default();
        self.push_many(targets, message).delivered
    }

    fn push_all(&self, message: &SignalMessage) -> usize {
        let targets: Vec<ConnectionId> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.push_many(targets, message).delivered
    }
}

fn encode(message: &SignalMessage) -> Option<String> {
    match message.encode() {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(signal = %message.signal, error = %err, "failed to encode outbound frame");
            None
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideline_core::{args, MemoryTopicCache};

    fn multiplexer(cache: MemoryTopicCache, config: MultiplexerConfig) -> ConnectionMultiplexer {
        ConnectionMultiplexer::new(Arc::new(cache), config)
    }

    fn frame(signal: &str) -> SignalMessage {
        SignalMessage::new(signal, args(serde_json::json!({"n": 1}))).with_signal_id("sid")
    }

    fn text(message: Message) -> SignalMessage {
        match message {
            Message::Text(text) => SignalMessage::decode(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn pushes_reach_the_right_connections() {
        let mux = multiplexer(MemoryTopicCache::new(), MultiplexerConfig::default());
        let mut alice_1 = mux.open(&"a1".into(), Some("alice"));
        let mut alice_2 = mux.open(&"a2".into(), Some("alice"));
        let mut bob = mux.open(&"b1".into(), Some("bob"));

        assert!(mux.push(&"a1".into(), &frame("one")));
        assert_eq!(mux.push_user("alice", &frame("two")), 2);
        assert_eq!(mux.push_all(&frame("three")), 3);
        assert!(!mux.push(&"missing".into(), &frame("four")));
        assert_eq!(mux.push_user("nobody", &frame("five")), 0);

        assert_eq!(text(alice_1.receiver.recv().await.unwrap()).signal, "one");
        assert_eq!(text(alice_1.receiver.recv().await.unwrap()).signal, "two");
        assert_eq!(text(alice_2.receiver.recv().await.unwrap()).signal, "two");
        let received = text(bob.receiver.recv().await.unwrap());
        assert_eq!(received.signal, "three");
        assert_eq!(received.signal_id.as_deref(), Some("sid"));
    }

    #[tokio::test]
    async fn closing_invalidates_topics() {
        let cache = MemoryTopicCache::new();
        let mux = multiplexer(cache.clone(), MultiplexerConfig::default());
        let id = ConnectionId::from("c1");
        cache
            .set_topics(&id, Some("7"), &["t".to_string()], Duration::from_secs(60))
            .await;
        let registration = mux.open(&id, Some("7"));

        assert!(mux.close(&id, registration.generation).await);
        assert_eq!(mux.active_connections(), 0);
        assert!(cache.topics_for(&id).await.is_none());
        assert_eq!(mux.push_user("7", &frame("late")), 0);
    }

    #[tokio::test]
    async fn stale_registrations_cannot_close_replacements() {
        let mux = multiplexer(MemoryTopicCache::new(), MultiplexerConfig::default());
        let id = ConnectionId::from("c1");
        let first = mux.open(&id, None);
        let mut second = mux.open(&id, None);

        assert!(!mux.close(&id, first.generation).await);
        assert!(mux.is_open(&id));
        assert!(mux.push(&id, &frame("still-here")));
        assert_eq!(text(second.receiver.recv().await.unwrap()).signal, "still-here");
    }

    #[tokio::test]
    async fn full_and_closed_channels_are_not_delivered() {
        let config = MultiplexerConfig {
            per_connection_buffer: 1,
            ..MultiplexerConfig::default()
        };
        let mux = multiplexer(MemoryTopicCache::new(), config);
        let _full = mux.open(&"full".into(), None);
        let gone = mux.open(&"gone".into(), None);
        drop(gone.receiver);

        assert!(mux.push(&"full".into(), &frame("first")));
        assert!(!mux.push(&"full".into(), &frame("second")));
        assert!(!mux.push(&"gone".into(), &frame("x")));
        assert!(!mux.is_open(&"gone".into()));
        assert!(mux.is_open(&"full".into()));
    }

    #[tokio::test]
    async fn closing_after_a_failed_send_still_invalidates_topics() {
        let cache = MemoryTopicCache::new();
        let mux = multiplexer(cache.clone(), MultiplexerConfig::default());
        let id = ConnectionId::from("c1");
        cache
            .set_topics(&id, None, &["t".to_string()], Duration::from_secs(60))
            .await;
        let registration = mux.open(&id, None);
        drop(registration.receiver);

        assert!(!mux.push(&id, &frame("lost")));
        assert!(!mux.is_open(&id));
        assert!(cache.topics_for(&id).await.is_some());

        assert!(mux.close(&id, registration.generation).await);
        assert!(cache.topics_for(&id).await.is_none());
    }

    #[tokio::test]
    async fn evicted_socket_leaves_its_successor_alone() {
        let cache = MemoryTopicCache::new();
        let mux = multiplexer(cache.clone(), MultiplexerConfig::default());
        let id = ConnectionId::from("c1");
        let first = mux.open(&id, None);
        drop(first.receiver);
        assert!(!mux.push(&id, &frame("lost")));

        cache
            .set_topics(&id, None, &["t".to_string()], Duration::from_secs(60))
            .await;
        let mut second = mux.open(&id, None);

        assert!(!mux.close(&id, first.generation).await);
        assert!(mux.is_open(&id));
        assert!(cache.topics_for(&id).await.is_some());
        assert!(mux.push(&id, &frame("fresh")));
        assert_eq!(text(second.receiver.recv().await.unwrap()).signal, "fresh");
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let config = MultiplexerConfig {
            idle_timeout: Some(Duration::from_secs(10)),
            ..MultiplexerConfig::default()
        };
        let mux = multiplexer(MemoryTopicCache::new(), config);
        let mut idle = mux.open(&"idle".into(), None);

        assert_eq!(mux.force_close_idle(now_millis()).await, 0);
        assert_eq!(mux.force_close_idle(now_millis() + 11_000).await, 1);
        assert!(matches!(idle.receiver.recv().await, Some(Message::Close(_))));
        assert_eq!(mux.active_connections(), 0);
    }
}
