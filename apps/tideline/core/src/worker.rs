use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::executor::{JobReceiver, SignalJob};
use crate::registry::{SignalCall, SignalRegistry};

const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Panicked,
    /// Arguments did not match the handler's spec; the handler was skipped.
    Rejected,
    /// The signal or handler index is not registered in this process.
    Unknown,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Panicked => "panicked",
            JobOutcome::Rejected => "rejected",
            JobOutcome::Unknown => "unknown",
        }
    }
}

/// Runs a single job against the registry.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<SignalRegistry>,
    dispatcher: Dispatcher,
}

impl JobRunner {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            registry: Arc::clone(dispatcher.registry()),
            dispatcher,
        }
    }

    pub async fn run(&self, job: SignalJob) -> JobOutcome {
        let outcome = self.execute(job.clone()).await;
        counter!(
            "tideline_jobs_total",
            1,
            "queue" => job.queue,
            "outcome" => outcome.as_str()
        );
        outcome
    }

    async fn execute(&self, job: SignalJob) -> JobOutcome {
        let Some(descriptor) = self.registry.descriptor(&job.signal, job.handler_index) else {
            warn!(
                signal = %job.signal,
                handler = job.handler_index,
                "job references an unregistered handler"
            );
            return JobOutcome::Unknown;
        };

        if let Err(violation) = descriptor.arguments().check(&job.arguments) {
            warn!(
                signal = %job.signal,
                handler = job.handler_index,
                error = %violation,
                "invalid arguments; handler skipped"
            );
            return JobOutcome::Rejected;
        }

        let signal = job.signal.clone();
        let call = SignalCall {
            signal: job.signal,
            signal_id: job.signal_id,
            context: job.context,
            arguments: job.arguments,
            from_client: job.from_client,
            dispatcher: self.dispatcher.clone(),
        };

        let started = Instant::now();
        let result = std::panic::AssertUnwindSafe(descriptor.handler().handle(call))
            .catch_unwind()
            .await;
        histogram!("tideline_job_duration_seconds", started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => {
                debug!(signal = %signal, queue = %job.queue, "signal handler completed");
                JobOutcome::Completed
            }
            Ok(Err(err)) => {
                warn!(signal = %signal, queue = %job.queue, error = ?err, "signal handler failed");
                JobOutcome::Failed
            }
            Err(_) => {
                error!(signal = %signal, queue = %job.queue, "signal handler panicked");
                JobOutcome::Panicked
            }
        }
    }
}

/// Concurrency limits per queue. Queues without an explicit size get
/// `default_size`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_size: usize,
    pub sizes: HashMap<String, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_POOL_SIZE,
            sizes: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_default_size(mut self, size: usize) -> Self {
        self.default_size = size;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>, size: usize) -> Self {
        self.sizes.insert(queue.into(), size);
        self
    }

    pub fn size_for(&self, queue: &str) -> usize {
        self.sizes
            .get(queue)
            .copied()
            .unwrap_or(self.default_size)
            .max(1)
    }
}

/// Executes jobs on tokio tasks, at most `size_for(queue)` at a time per
/// queue.
pub struct WorkerPool {
    runner: JobRunner,
    config: PoolConfig,
    permits: HashMap<String, Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(runner: JobRunner, config: PoolConfig) -> Self {
        Self {
            runner,
            config,
            permits: HashMap::new(),
        }
    }

    /// Starts a job without waiting for it. The job waits for a permit of its
    /// queue before running; a free permit is taken immediately so
    /// [`WorkerPool::idle_slots`] reflects the submission.
    pub fn submit(&mut self, job: SignalJob) -> JoinHandle<JobOutcome> {
        let permits = self.permits_for(&job.queue);
        match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => self.start(job, permit),
            Err(_) => {
                let runner = self.runner.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    runner.run(job).await
                })
            }
        }
    }

    fn start(&self, job: SignalJob, permit: OwnedSemaphorePermit) -> JoinHandle<JobOutcome> {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            runner.run(job).await
        })
    }

    /// Permits of `queue` not currently held by a running job.
    pub fn idle_slots(&mut self, queue: &str) -> usize {
        self.permits_for(queue).available_permits()
    }

    fn permits_for(&mut self, queue: &str) -> Arc<Semaphore> {
        let size = self.config.size_for(queue);
        Arc::clone(
            self.permits
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(size))),
        )
    }

    /// Drains the local executor's channel until every sender is gone. A job
    /// is only taken off the channel once its queue has a free permit, so a
    /// backlog stays in the channel.
    pub fn spawn(mut self, mut jobs: JobReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let permits = self.permits_for(&job.queue);
                let Ok(permit) = permits.acquire_owned().await else {
                    break;
                };
                self.start(job, permit);
            }
            debug!("local job channel closed; worker pool stopping");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WindowContext;
    use crate::executor::{LocalExecutor, QueueExecutor};
    use crate::message::{args, Arguments};
    use crate::registry::{handler_fn, ArgumentKind, ArgumentSpec};
    use crate::testing::{harness, RecordingDelivery};
    use crate::MemoryTopicCache;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn job(signal: &str, handler_index: usize, arguments: Arguments) -> SignalJob {
        SignalJob {
            signal: signal.to_string(),
            signal_id: "id-1".into(),
            context: WindowContext::for_connection("c1"),
            arguments,
            queue: "default".into(),
            handler_index,
            from_client: false,
        }
    }

    #[tokio::test]
    async fn runner_invokes_the_indexed_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = SignalRegistry::new();
        registry.signal("s").handler(handler_fn(|_| async { Ok(()) })).unwrap();
        let counter = hits.clone();
        registry
            .signal("s")
            .handler(handler_fn(move |call: SignalCall| {
                let counter = counter.clone();
                async move {
                    assert_eq!(call.arguments.get("n"), Some(&json!(2)));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
        let (dispatcher, _, _) = harness(registry);
        let runner = JobRunner::new(dispatcher);

        assert_eq!(runner.run(job("s", 1, args(json!({"n": 2})))).await, JobOutcome::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runner.run(job("s", 5, Arguments::new())).await, JobOutcome::Unknown);
    }

    #[tokio::test]
    async fn invalid_arguments_skip_the_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut registry = SignalRegistry::new();
        registry
            .signal("s")
            .arguments(ArgumentSpec::strict().required("id", ArgumentKind::Integer))
            .handler(handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
            .unwrap();
        let runner = JobRunner::new(harness(registry).0);

        let outcome = runner.run(job("s", 0, args(json!({"id": "nope"})))).await;
        assert_eq!(outcome, JobOutcome::Rejected);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let mut registry = SignalRegistry::new();
        registry
            .signal("fails")
            .handler(handler_fn(|_| async { Err(anyhow::anyhow!("boom")) }))
            .unwrap();
        registry
            .signal("panics")
            .handler(handler_fn(|call: SignalCall| async move {
                if call.arguments.is_empty() {
                    panic!("handler bug");
                }
                Ok(())
            }))
            .unwrap();
        let runner = JobRunner::new(harness(registry).0);

        assert_eq!(runner.run(job("fails", 0, Arguments::new())).await, JobOutcome::Failed);
        assert_eq!(runner.run(job("panics", 0, Arguments::new())).await, JobOutcome::Panicked);
    }

    #[tokio::test]
    async fn pool_limits_concurrency_per_queue() {
        let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut registry = SignalRegistry::new();
        let (gate, active, max) = (release_rx.clone(), running.clone(), peak.clone());
        registry
            .signal("slow")
            .handler(handler_fn(move |_| {
                let (gate, active, max) = (gate.clone(), active.clone(), max.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    gate.lock().await.recv().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
        let runner = JobRunner::new(harness(registry).0);
        let mut pool = WorkerPool::new(runner, PoolConfig::default().with_queue("default", 2));

        let handles: Vec<_> = (0..4)
            .map(|_| pool.submit(job("slow", 0, Arguments::new())))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_slots("default"), 0);

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), JobOutcome::Completed);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn local_executor_feeds_the_pool() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut registry = SignalRegistry::new();
        registry
            .signal("s")
            .handler(handler_fn(move |call: SignalCall| {
                let done = done_tx.clone();
                async move {
                    let _ = done.send(call.signal_id);
                    Ok(())
                }
            }))
            .unwrap();

        let (executor, jobs) = LocalExecutor::channel();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(executor.clone()),
            Arc::new(RecordingDelivery::new()),
            Arc::new(MemoryTopicCache::new()),
        );
        WorkerPool::new(JobRunner::new(dispatcher), PoolConfig::default()).spawn(jobs);

        executor.enqueue(job("s", 0, Arguments::new())).await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn local_backlog_does_not_spawn_waiting_tasks() {
        let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(release_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let mut registry = SignalRegistry::new();
        registry
            .signal("slow")
            .handler(handler_fn(move |_| {
                let (gate, done) = (gate.clone(), done_tx.clone());
                async move {
                    gate.lock().await.recv().await;
                    let _ = done.send(());
                    Ok(())
                }
            }))
            .unwrap();

        let (executor, jobs) = LocalExecutor::channel();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(executor.clone()),
            Arc::new(RecordingDelivery::new()),
            Arc::new(MemoryTopicCache::new()),
        );
        let config = PoolConfig::default().with_queue("default", 1);
        let consumer = WorkerPool::new(JobRunner::new(dispatcher), config).spawn(jobs);

        for _ in 0..5 {
            executor.enqueue(job("slow", 0, Arguments::new())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The consumer loop plus the one running job.
        assert_eq!(tokio::runtime::Handle::current().metrics().num_alive_tasks(), 2);

        for _ in 0..5 {
            release_tx.send(()).unwrap();
        }
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        consumer.abort();
    }

    #[test]
    fn pool_sizes_fall_back_to_default() {
        let config = PoolConfig::default().with_queue("fast", 3).with_queue("zero", 0);
        assert_eq!(config.size_for("fast"), 3);
        assert_eq!(config.size_for("other"), DEFAULT_POOL_SIZE);
        assert_eq!(config.size_for("zero"), 1);
    }
}
