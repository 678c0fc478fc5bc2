use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::WindowContext;
use crate::error::ExecutorError;
use crate::message::Arguments;

/// One handler invocation, in the form it travels through a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalJob {
    pub signal: String,
    pub signal_id: String,
    pub context: WindowContext,
    pub arguments: Arguments,
    pub queue: String,
    /// Position of the handler among the signal's registered handlers.
    pub handler_index: usize,
    pub from_client: bool,
}

/// Hands jobs to whatever eventually runs them. Enqueueing is fire and
/// forget: no result flows back to the trigger.
#[async_trait]
pub trait QueueExecutor: Send + Sync {
    async fn enqueue(&self, job: SignalJob) -> Result<(), ExecutorError>;
}

/// In-process executor feeding a [`crate::worker::WorkerPool`].
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    tx: mpsc::UnboundedSender<SignalJob>,
}

pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<SignalJob>,
}

impl LocalExecutor {
    pub fn channel() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<SignalJob> {
        self.rx.recv().await
    }
}

#[async_trait]
impl QueueExecutor for LocalExecutor {
    async fn enqueue(&self, job: SignalJob) -> Result<(), ExecutorError> {
        self.tx
            .send(job)
            .map_err(|err| ExecutorError::Closed(err.0.queue))
    }
}
