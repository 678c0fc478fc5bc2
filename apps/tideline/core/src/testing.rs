//! In-memory doubles for exercising signal flows without sockets or queues.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::MemoryTopicCache;
use crate::context::ConnectionId;
use crate::dispatch::{Delivery, Dispatcher};
use crate::error::ExecutorError;
use crate::executor::{QueueExecutor, SignalJob};
use crate::message::SignalMessage;
use crate::registry::SignalRegistry;

/// Records enqueued jobs instead of running them.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    jobs: Arc<Mutex<Vec<SignalJob>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later enqueue on `queue` fail.
    pub fn fail_queue(&self, queue: &str) {
        self.failing.lock().insert(queue.to_string());
    }

    pub fn jobs(&self) -> Vec<SignalJob> {
        self.jobs.lock().clone()
    }

    pub fn jobs_on(&self, queue: &str) -> Vec<SignalJob> {
        self.jobs
            .lock()
            .iter()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    pub fn take(&self) -> Vec<SignalJob> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

#[async_trait]
impl QueueExecutor for RecordingExecutor {
    async fn enqueue(&self, job: SignalJob) -> Result<(), ExecutorError> {
        if self.failing.lock().contains(&job.queue) {
            return Err(ExecutorError::Backend(format!("queue {} is unavailable", job.queue)));
        }
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// A fake set of live connections that records every frame pushed to them.
#[derive(Clone, Default)]
pub struct RecordingDelivery {
    state: Arc<Mutex<DeliveryState>>,
}

#[derive(Default)]
struct DeliveryState {
    live: BTreeMap<ConnectionId, Option<String>>,
    pushes: Vec<(ConnectionId, SignalMessage)>,
    calls: usize,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, connection: &str, user_id: Option<&str>) {
        self.state
            .lock()
            .live
            .insert(ConnectionId::from(connection), user_id.map(str::to_string));
    }

    pub fn close(&self, connection: &str) {
        self.state.lock().live.remove(&ConnectionId::from(connection));
    }

    pub fn pushes(&self) -> Vec<(ConnectionId, SignalMessage)> {
        self.state.lock().pushes.clone()
    }

    pub fn pushes_to(&self, connection: &str) -> Vec<SignalMessage> {
        self.state
            .lock()
            .pushes
            .iter()
            .filter(|(id, _)| id.as_str() == connection)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Number of times any `Delivery` method was called.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

impl Delivery for RecordingDelivery {
    fn push(&self, connection: &ConnectionId, message: &SignalMessage) -> bool {
        let mut state = self.state.lock();
        state.calls += 1;
        if !state.live.contains_key(connection) {
            return false;
        }
        state.pushes.push((connection.clone(), message.clone()));
        true
    }

    fn push_user(&self, user_id: &str, message: &SignalMessage) -> usize {
        let mut state = self.state.lock();
        state.calls += 1;
        let targets: Vec<ConnectionId> = state
            .live
            .iter()
            .filter(|(_, user)| user.as_deref() == Some(user_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &targets {
            state.pushes.push((id.clone(), message.clone()));
        }
        targets.len()
    }

    fn push_all(&self, message: &SignalMessage) -> usize {
        let mut state = self.state.lock();
        state.calls += 1;
        let targets: Vec<ConnectionId> = state.live.keys().cloned().collect();
        for id in &targets {
            state.pushes.push((id.clone(), message.clone()));
        }
        targets.len()
    }
}

/// A dispatcher over recording doubles and a fresh in-memory topic cache.
pub fn harness(registry: SignalRegistry) -> (Dispatcher, RecordingExecutor, RecordingDelivery) {
    harness_with_cache(registry, MemoryTopicCache::new())
}

pub fn harness_with_cache(
    registry: SignalRegistry,
    cache: MemoryTopicCache,
) -> (Dispatcher, RecordingExecutor, RecordingDelivery) {
    let executor = RecordingExecutor::new();
    let delivery = RecordingDelivery::new();
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(executor.clone()),
        Arc::new(delivery.clone()),
        Arc::new(cache),
    );
    (dispatcher, executor, delivery)
}
