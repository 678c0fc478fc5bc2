use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, RedisResult};
use tideline_core::{ExecutorError, QueueExecutor, SignalJob, WorkerPool};
use tracing::{debug, info, warn};

const MAX_BATCH: usize = 128;
const DEFAULT_WORKER: &str = "worker";

/// One Redis list per queue: `{prefix}:queue:{name}`. Producers `RPUSH`.
/// Workers `LMOVE` each payload into their own processing list
/// `{prefix}:processing:{name}:{worker}` and remove it once the handler has
/// run, so a job claimed by a worker that dies is run again when a worker
/// with the same name restarts.
#[derive(Clone)]
pub struct RedisQueueExecutor {
    redis: ConnectionManager,
    prefix: String,
    worker: String,
}

/// A job moved into this worker's processing list.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: SignalJob,
    payload: String,
}

impl RedisQueueExecutor {
    pub async fn connect(url: &str, prefix: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let redis = client.get_connection_manager().await?;
        Ok(Self {
            redis,
            prefix: prefix.to_string(),
            worker: DEFAULT_WORKER.to_string(),
        })
    }

    /// Names the processing lists this executor claims jobs into.
    pub fn claimed_by(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    fn list_key(&self, queue: &str) -> String {
        list_key(&self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        processing_key(&self.prefix, queue, &self.worker)
    }

    /// Claims up to `max` jobs. Payloads that no longer decode are logged and
    /// dropped from the processing list right away.
    pub async fn pop(&self, queue: &str, max: usize) -> RedisResult<Vec<ClaimedJob>> {
        let mut conn = self.redis.clone();
        let key = self.list_key(queue);
        let processing = self.processing_key(queue);
        let mut jobs = Vec::new();
        for _ in 0..max {
            let item: Option<String> = conn
                .lmove(&key, &processing, Direction::Left, Direction::Right)
                .await?;
            let Some(payload) = item else {
                break;
            };
            match serde_json::from_str::<SignalJob>(&payload) {
                Ok(job) => jobs.push(ClaimedJob { job, payload }),
                Err(err) => {
                    warn!(queue, error = %err, "discarding undecodable job");
                    conn.lrem::<_, _, ()>(&processing, 1, &payload).await?;
                }
            }
        }
        Ok(jobs)
    }

    /// Forgets a claimed job once its handler has run.
    pub async fn ack(&self, queue: &str, claimed: &ClaimedJob) -> RedisResult<()> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(self.processing_key(queue), 1, &claimed.payload)
            .await
    }

    /// Puts jobs left in this worker's processing list by an earlier run
    /// back at the head of the queue, in their original order.
    pub async fn requeue_claimed(&self, queue: &str) -> RedisResult<usize> {
        let mut conn = self.redis.clone();
        let key = self.list_key(queue);
        let processing = self.processing_key(queue);
        let mut moved = 0usize;
        loop {
            let item: Option<String> = conn
                .lmove(&processing, &key, Direction::Right, Direction::Left)
                .await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

fn list_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:queue:{queue}")
}

fn processing_key(prefix: &str, queue: &str, worker: &str) -> String {
    format!("{prefix}:processing:{queue}:{worker}")
}

#[async_trait]
impl QueueExecutor for RedisQueueExecutor {
    async fn enqueue(&self, job: SignalJob) -> Result<(), ExecutorError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(self.list_key(&job.queue), payload)
            .await
            .map_err(|err| ExecutorError::Backend(err.to_string()))?;
        counter!("tideline_jobs_enqueued_total", 1, "queue" => job.queue);
        Ok(())
    }
}

/// Moves jobs from the Redis queues into the pool until `shutdown`
/// resolves. A queue is only polled while the pool has idle slots for it.
pub async fn run_worker<F>(
    queue: RedisQueueExecutor,
    queues: Vec<String>,
    mut pool: WorkerPool,
    poll_interval: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    for name in &queues {
        match queue.requeue_claimed(name).await {
            Ok(0) => {}
            Ok(moved) => info!(queue = %name, moved, "requeued jobs left by a previous run"),
            Err(err) => warn!(queue = %name, error = %err, "failed to requeue claimed jobs"),
        }
    }
    info!(queues = ?queues, worker = %queue.worker, "worker consuming queues");
    loop {
        let mut drained = 0usize;
        for name in &queues {
            let slots = pool.idle_slots(name).min(MAX_BATCH);
            if slots == 0 {
                continue;
            }
            match queue.pop(name, slots).await {
                Ok(jobs) => {
                    drained += jobs.len();
                    for claimed in jobs {
                        let running = pool.submit(claimed.job.clone());
                        let acker = queue.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            if running.await.is_err() {
                                return;
                            }
                            match acker.ack(&name, &claimed).await {
                                Ok(()) => debug!(queue = %name, "job acknowledged"),
                                Err(err) => {
                                    warn!(queue = %name, error = %err, "failed to acknowledge job")
                                }
                            }
                        });
                    }
                }
                Err(err) => warn!(queue = %name, error = %err, "failed to pop jobs"),
            }
        }

        let pause = if drained == 0 {
            poll_interval
        } else {
            Duration::ZERO
        };
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    info!("worker stopped consuming");
}
