use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::TopicCache;
use crate::context::{ConnectionId, WindowContext};
use crate::error::{TargetError, TriggerError};
use crate::executor::{QueueExecutor, SignalJob};
use crate::message::{reserved_argument, Arguments, SignalMessage};
use crate::registry::SignalRegistry;
use crate::target::{Target, TopicValue};
use crate::topic::{DefaultTopicSerializer, TopicSerializer};
use crate::worker::JobRunner;

/// Pushes frames to live connections. Unknown or closed connections are a
/// silent no-op; the return values count frames accepted for sending.
pub trait Delivery: Send + Sync {
    fn push(&self, connection: &ConnectionId, message: &SignalMessage) -> bool;

    fn push_user(&self, user_id: &str, message: &SignalMessage) -> usize;

    fn push_all(&self, message: &SignalMessage) -> usize;
}

/// What one trigger did. Purely informational; the caller never waits on
/// handlers or sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub signal_id: String,
    /// Handler jobs accepted by the executor.
    pub enqueued: usize,
    /// Handlers run in place for a `Sync` target, whatever their outcome.
    pub ran_inline: usize,
    /// Handlers skipped by their permission predicate.
    pub denied: usize,
    /// Frames accepted by the delivery layer.
    pub pushed: usize,
    /// Targets that did not apply to the context, such as `Window` without
    /// a connection.
    pub skipped: usize,
    pub errors: Vec<TargetError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<SignalRegistry>,
    executor: Arc<dyn QueueExecutor>,
    delivery: Arc<dyn Delivery>,
    topics: Arc<dyn TopicCache>,
    serializer: Arc<dyn TopicSerializer>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SignalRegistry>,
        executor: Arc<dyn QueueExecutor>,
        delivery: Arc<dyn Delivery>,
        topics: Arc<dyn TopicCache>,
    ) -> Self {
        Self::with_serializer(
            registry,
            executor,
            delivery,
            topics,
            Arc::new(DefaultTopicSerializer),
        )
    }

    pub fn with_serializer(
        registry: Arc<SignalRegistry>,
        executor: Arc<dyn QueueExecutor>,
        delivery: Arc<dyn Delivery>,
        topics: Arc<dyn TopicCache>,
        serializer: Arc<dyn TopicSerializer>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                executor,
                delivery,
                topics,
                serializer,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.inner.registry
    }

    pub fn topics(&self) -> &Arc<dyn TopicCache> {
        &self.inner.topics
    }

    pub fn serializer(&self) -> &Arc<dyn TopicSerializer> {
        &self.inner.serializer
    }

    /// Server-originated trigger. Every handler of the signal runs for a
    /// `Server` target; predicates only gate calls coming from clients.
    pub async fn trigger(
        &self,
        context: &WindowContext,
        signal: &str,
        targets: &[Target],
        arguments: Arguments,
    ) -> Result<TriggerReport, TriggerError> {
        self.dispatch(context, signal, targets, arguments, false)
            .await
    }

    /// A frame received on a client connection. Only handlers whose predicate
    /// allows the context are enqueued.
    pub async fn trigger_from_client(
        &self,
        context: &WindowContext,
        signal: &str,
        arguments: Arguments,
    ) -> Result<TriggerReport, TriggerError> {
        self.dispatch(context, signal, &[Target::Server], arguments, true)
            .await
    }

    async fn dispatch(
        &self,
        context: &WindowContext,
        signal: &str,
        targets: &[Target],
        arguments: Arguments,
        from_client: bool,
    ) -> Result<TriggerReport, TriggerError> {
        if signal.trim().is_empty() {
            return Err(TriggerError::EmptySignalName);
        }
        if targets.is_empty() {
            return Err(TriggerError::NoTargets(signal.to_string()));
        }
        if let Some(argument) = reserved_argument(&arguments) {
            return Err(TriggerError::ReservedArgument {
                signal: signal.to_string(),
                argument: argument.to_string(),
            });
        }

        let signal_id = Uuid::new_v4().to_string();
        let mut report = TriggerReport {
            signal_id: signal_id.clone(),
            ..TriggerReport::default()
        };
        let needs_push = targets
            .iter()
            .any(|target| !matches!(target, Target::Server | Target::Sync));
        let message = needs_push
            .then(|| SignalMessage::new(signal, arguments.clone()).with_signal_id(signal_id.clone()));

        debug!(
            signal,
            signal_id = %signal_id,
            targets = targets.len(),
            from_client,
            "dispatching signal"
        );

        for target in targets {
            match (target, &message) {
                (Target::Server, _) => {
                    self.enqueue_handlers(context, signal, &arguments, from_client, &mut report)
                        .await
                }
                (Target::Sync, _) => {
                    self.run_handlers(context, signal, &arguments, from_client, &mut report)
                        .await
                }
                (Target::Window, Some(message)) => match context.connection_id() {
                    Some(connection) => {
                        if self.inner.delivery.push(connection, message) {
                            report.pushed += 1;
                        }
                    }
                    None => {
                        debug!(signal, "no connection in context; WINDOW target skipped");
                        report.skipped += 1;
                    }
                },
                (Target::User, Some(message)) => match context.user_id() {
                    Some(user_id) => report.pushed += self.inner.delivery.push_user(user_id, message),
                    None => {
                        debug!(signal, "anonymous context; USER target skipped");
                        report.skipped += 1;
                    }
                },
                (Target::Session, Some(message)) => match context.session() {
                    Some(key) => {
                        let topic = TopicValue::Session(key.to_string());
                        self.push_topic(context, signal, &topic, message, &mut report)
                            .await
                    }
                    None => {
                        debug!(signal, "no session in context; SESSION target skipped");
                        report.skipped += 1;
                    }
                },
                (Target::Broadcast, Some(message)) => {
                    report.pushed += self.inner.delivery.push_all(message);
                }
                (Target::Topic(topic), Some(message)) => {
                    self.push_topic(context, signal, topic, message, &mut report)
                        .await
                }
                (_, None) => {}
            }
        }

        let origin = if from_client { "client" } else { "server" };
        counter!("tideline_signals_triggered_total", 1, "origin" => origin);
        if !report.errors.is_empty() {
            counter!("tideline_trigger_target_errors_total", report.errors.len() as u64);
        }
        Ok(report)
    }

    /// One job per handler the context may run, in registration order.
    fn permitted_jobs(
        &self,
        context: &WindowContext,
        signal: &str,
        arguments: &Arguments,
        from_client: bool,
        report: &mut TriggerReport,
    ) -> Vec<SignalJob> {
        let mut jobs = Vec::new();
        for descriptor in self.inner.registry.resolve(signal) {
            if from_client && !self.inner.registry.is_permitted(descriptor, context) {
                debug!(signal, handler = descriptor.index(), "client call denied by predicate");
                report.denied += 1;
                continue;
            }
            jobs.push(SignalJob {
                signal: signal.to_string(),
                signal_id: report.signal_id.clone(),
                context: context.clone(),
                arguments: arguments.clone(),
                queue: descriptor.queue_for(context, arguments),
                handler_index: descriptor.index(),
                from_client,
            });
        }
        jobs
    }

    async fn enqueue_handlers(
        &self,
        context: &WindowContext,
        signal: &str,
        arguments: &Arguments,
        from_client: bool,
        report: &mut TriggerReport,
    ) {
        for job in self.permitted_jobs(context, signal, arguments, from_client, report) {
            let queue = job.queue.clone();
            match self.inner.executor.enqueue(job).await {
                Ok(()) => report.enqueued += 1,
                Err(err) => {
                    warn!(signal, queue = %queue, error = %err, "failed to enqueue signal handler");
                    report.errors.push(TargetError::Executor {
                        queue,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Runs each handler to completion on the calling task, one after the
    /// other. Failures are logged by the runner and never abort the trigger.
    async fn run_handlers(
        &self,
        context: &WindowContext,
        signal: &str,
        arguments: &Arguments,
        from_client: bool,
        report: &mut TriggerReport,
    ) {
        let jobs = self.permitted_jobs(context, signal, arguments, from_client, report);
        if jobs.is_empty() {
            return;
        }
        let runner = JobRunner::new(self.clone());
        for job in jobs {
            let outcome = runner.run(job).await;
            debug!(signal, outcome = ?outcome, "handler ran in place");
            report.ran_inline += 1;
        }
    }

    async fn push_topic(
        &self,
        context: &WindowContext,
        signal: &str,
        topic: &TopicValue,
        message: &SignalMessage,
        report: &mut TriggerReport,
    ) {
        let key = match self.inner.serializer.serialize(context, topic) {
            Ok(key) => key,
            Err(err) => {
                warn!(signal, error = %err, "topic target skipped");
                report.errors.push(err.into());
                return;
            }
        };
        for connection in self.inner.topics.get_connections_for_topic(&key).await {
            if self.inner.delivery.push(&connection, message) {
                report.pushed += 1;
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
