use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::WindowContext;
use crate::dispatch::Dispatcher;
use crate::error::{ArgumentViolation, ConfigurationError, PredicateError};
use crate::message::{Arguments, RESERVED_ARGUMENTS};

pub const DEFAULT_QUEUE: &str = "default";

/// Everything a server-side handler receives for one invocation.
pub struct SignalCall {
    pub signal: String,
    pub signal_id: String,
    pub context: WindowContext,
    pub arguments: Arguments,
    pub from_client: bool,
    /// For follow-up triggers from inside the handler.
    pub dispatcher: Dispatcher,
}

#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, call: SignalCall) -> anyhow::Result<()>;
}

pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> SignalHandler for HandlerFn<F>
where
    F: Fn(SignalCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, call: SignalCall) -> anyhow::Result<()> {
        (self.0)(call).await
    }
}

/// Wraps an async closure as a [`SignalHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(SignalCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

/// Decides whether a client-originated call may reach a handler.
pub trait Predicate: Send + Sync {
    fn allows(&self, context: &WindowContext) -> Result<bool, PredicateError>;
}

pub struct PredicateFn<F>(F);

impl<F> Predicate for PredicateFn<F>
where
    F: Fn(&WindowContext) -> Result<bool, PredicateError> + Send + Sync,
{
    fn allows(&self, context: &WindowContext) -> Result<bool, PredicateError> {
        (self.0)(context)
    }
}

pub fn predicate_fn<F>(f: F) -> PredicateFn<F>
where
    F: Fn(&WindowContext) -> Result<bool, PredicateError> + Send + Sync,
{
    PredicateFn(f)
}

/// Denies every client call. The default for new registrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSide;

impl Predicate for ServerSide {
    fn allows(&self, _context: &WindowContext) -> Result<bool, PredicateError> {
        Ok(false)
    }
}

pub fn server_side() -> ServerSide {
    ServerSide
}

struct ContextCheck(fn(&WindowContext) -> bool);

impl Predicate for ContextCheck {
    fn allows(&self, context: &WindowContext) -> Result<bool, PredicateError> {
        Ok((self.0)(context))
    }
}

pub fn everyone() -> impl Predicate {
    ContextCheck(|_| true)
}

pub fn is_authenticated() -> impl Predicate {
    ContextCheck(|context| context.is_authenticated())
}

pub fn is_anonymous() -> impl Predicate {
    ContextCheck(|context| !context.is_authenticated())
}

pub fn is_staff() -> impl Predicate {
    ContextCheck(|context| context.user().is_some_and(|user| user.is_staff))
}

pub fn is_superuser() -> impl Predicate {
    ContextCheck(|context| context.user().is_some_and(|user| user.is_superuser))
}

#[derive(Debug, Clone)]
pub struct HasPerm(String);

impl Predicate for HasPerm {
    fn allows(&self, context: &WindowContext) -> Result<bool, PredicateError> {
        Ok(context.user().is_some_and(|user| user.has_perm(&self.0)))
    }
}

pub fn has_perm(perm: impl Into<String>) -> HasPerm {
    HasPerm(perm.into())
}

/// Picks a queue per trigger.
pub trait DynamicQueue: Send + Sync {
    fn select(&self, signal: &str, context: &WindowContext, arguments: &Arguments) -> String;

    /// Every queue [`DynamicQueue::select`] can return.
    fn available_queues(&self) -> BTreeSet<String>;
}

/// Spreads jobs over `prefix0 .. prefix{size-1}`.
#[derive(Debug, Clone)]
pub struct RandomQueue {
    prefix: String,
    size: usize,
}

impl RandomQueue {
    pub fn new(prefix: impl Into<String>, size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            size: size.max(1),
        }
    }
}

impl DynamicQueue for RandomQueue {
    fn select(&self, _signal: &str, _context: &WindowContext, _arguments: &Arguments) -> String {
        let index = rand::thread_rng().gen_range(0..self.size);
        format!("{}{}", self.prefix, index)
    }

    fn available_queues(&self) -> BTreeSet<String> {
        (0..self.size)
            .map(|index| format!("{}{}", self.prefix, index))
            .collect()
    }
}

#[derive(Clone)]
pub enum QueueSelector {
    Fixed(String),
    Dynamic(Arc<dyn DynamicQueue>),
}

impl QueueSelector {
    pub fn dynamic(selector: impl DynamicQueue + 'static) -> Self {
        QueueSelector::Dynamic(Arc::new(selector))
    }

    fn resolve(&self, signal: &str, context: &WindowContext, arguments: &Arguments) -> String {
        match self {
            QueueSelector::Fixed(queue) => queue.clone(),
            QueueSelector::Dynamic(selector) => {
                let queue = selector.select(signal, context, arguments);
                if queue.is_empty() {
                    DEFAULT_QUEUE.to_string()
                } else {
                    queue
                }
            }
        }
    }

    fn available(&self) -> BTreeSet<String> {
        match self {
            QueueSelector::Fixed(queue) => BTreeSet::from([queue.clone()]),
            QueueSelector::Dynamic(selector) => selector.available_queues(),
        }
    }
}

impl Default for QueueSelector {
    fn default() -> Self {
        QueueSelector::Fixed(DEFAULT_QUEUE.to_string())
    }
}

impl fmt::Debug for QueueSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueSelector::Fixed(queue) => f.debug_tuple("Fixed").field(queue).finish(),
            QueueSelector::Dynamic(selector) => f
                .debug_tuple("Dynamic")
                .field(&selector.available_queues())
                .finish(),
        }
    }
}

impl From<&str> for QueueSelector {
    fn from(queue: &str) -> Self {
        QueueSelector::Fixed(queue.to_string())
    }
}

impl From<String> for QueueSelector {
    fn from(queue: String) -> Self {
        QueueSelector::Fixed(queue)
    }
}

impl From<RandomQueue> for QueueSelector {
    fn from(queue: RandomQueue) -> Self {
        QueueSelector::dynamic(queue)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentKind {
    Any,
    String,
    Integer,
    Number,
    Bool,
    List,
    Map,
    Choice(Vec<Value>),
}

impl ArgumentKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgumentKind::Any => true,
            ArgumentKind::String => value.is_string(),
            ArgumentKind::Integer => value.is_i64() || value.is_u64(),
            ArgumentKind::Number => value.is_number(),
            ArgumentKind::Bool => value.is_boolean(),
            ArgumentKind::List => value.is_array(),
            ArgumentKind::Map => value.is_object(),
            ArgumentKind::Choice(choices) => choices.contains(value),
        }
    }
}

/// The arguments a handler expects. The default accepts anything.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    required: Vec<(String, ArgumentKind)>,
    optional: Vec<(String, ArgumentKind)>,
    accept_extra: bool,
}

impl Default for ArgumentSpec {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
            accept_extra: true,
        }
    }
}

impl ArgumentSpec {
    /// Rejects arguments that are not declared.
    pub fn strict() -> Self {
        Self {
            accept_extra: false,
            ..Self::default()
        }
    }

    pub fn required(mut self, name: impl Into<String>, kind: ArgumentKind) -> Self {
        self.required.push((name.into(), kind));
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ArgumentKind) -> Self {
        self.optional.push((name.into(), kind));
        self
    }

    pub fn accept_extra(mut self, accept: bool) -> Self {
        self.accept_extra = accept;
        self
    }

    pub fn check(&self, arguments: &Arguments) -> Result<(), ArgumentViolation> {
        for (name, kind) in &self.required {
            match arguments.get(name) {
                None => return Err(ArgumentViolation::Missing(name.clone())),
                Some(value) if !kind.accepts(value) => {
                    return Err(ArgumentViolation::Invalid {
                        name: name.clone(),
                        value: value.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for (name, kind) in &self.optional {
            if let Some(value) = arguments.get(name) {
                if !kind.accepts(value) {
                    return Err(ArgumentViolation::Invalid {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        if !self.accept_extra {
            if let Some(extra) = arguments.keys().find(|key| !self.declares(key)) {
                return Err(ArgumentViolation::Unexpected(extra.clone()));
            }
        }
        Ok(())
    }

    fn declares(&self, name: &str) -> bool {
        self.names().any(|declared| declared == name)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(|(name, _)| name.as_str())
    }

    fn validate(&self, signal: &str) -> Result<(), ConfigurationError> {
        let mut seen = BTreeSet::new();
        for name in self.names() {
            if RESERVED_ARGUMENTS.contains(&name) {
                return Err(ConfigurationError::ReservedArgument {
                    signal: signal.to_string(),
                    argument: name.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(ConfigurationError::DuplicateArgument {
                    signal: signal.to_string(),
                    argument: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One registered handler of a signal.
pub struct HandlerDescriptor {
    signal: String,
    index: usize,
    predicate: Arc<dyn Predicate>,
    queue: QueueSelector,
    arguments: ArgumentSpec,
    handler: Arc<dyn SignalHandler>,
}

impl HandlerDescriptor {
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Position among the handlers of the same signal.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue_for(&self, context: &WindowContext, arguments: &Arguments) -> String {
        self.queue.resolve(&self.signal, context, arguments)
    }

    pub fn arguments(&self) -> &ArgumentSpec {
        &self.arguments
    }

    pub fn handler(&self) -> &Arc<dyn SignalHandler> {
        &self.handler
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("signal", &self.signal)
            .field("index", &self.index)
            .field("queue", &self.queue)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Handlers by signal name, in registration order. Filled during startup and
/// then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct SignalRegistry {
    signals: HashMap<String, Vec<Arc<HandlerDescriptor>>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H, P>(
        &mut self,
        signal: &str,
        handler: H,
        predicate: P,
        queue: impl Into<QueueSelector>,
    ) -> Result<(), ConfigurationError>
    where
        H: SignalHandler + 'static,
        P: Predicate + 'static,
    {
        self.signal(signal)
            .allowed(predicate)
            .queue(queue)
            .handler(handler)
    }

    /// Starts a registration with the defaults: server-side only, default
    /// queue, any arguments.
    pub fn signal(&mut self, signal: &str) -> Registration<'_> {
        Registration {
            registry: self,
            signal: signal.to_string(),
            predicate: Arc::new(ServerSide),
            queue: QueueSelector::default(),
            arguments: ArgumentSpec::default(),
        }
    }

    pub fn resolve(&self, signal: &str) -> &[Arc<HandlerDescriptor>] {
        match self.signals.get(signal) {
            Some(descriptors) => descriptors,
            None => {
                debug!(signal, "no handlers registered");
                &[]
            }
        }
    }

    pub fn descriptor(&self, signal: &str, index: usize) -> Option<&Arc<HandlerDescriptor>> {
        self.signals.get(signal).and_then(|descriptors| descriptors.get(index))
    }

    /// Errors and panics from the predicate count as a denial.
    pub fn is_permitted(&self, descriptor: &HandlerDescriptor, context: &WindowContext) -> bool {
        match catch_unwind(AssertUnwindSafe(|| descriptor.predicate.allows(context))) {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(err)) => {
                warn!(
                    signal = %descriptor.signal,
                    handler = descriptor.index,
                    error = %err,
                    "permission predicate failed; denying"
                );
                false
            }
            Err(_) => {
                warn!(
                    signal = %descriptor.signal,
                    handler = descriptor.index,
                    "permission predicate panicked; denying"
                );
                false
            }
        }
    }

    /// Every queue some handler can be sent to.
    pub fn expected_queues(&self) -> BTreeSet<String> {
        self.signals
            .values()
            .flatten()
            .flat_map(|descriptor| descriptor.queue.available())
            .collect()
    }

    pub fn signal_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.signals.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.signals.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    fn insert(&mut self, registration: PendingRegistration) -> Result<(), ConfigurationError> {
        let PendingRegistration {
            signal,
            predicate,
            queue,
            arguments,
            handler,
        } = registration;
        if !is_valid_signal_name(&signal) {
            return Err(ConfigurationError::InvalidSignalName(signal));
        }
        if let QueueSelector::Fixed(name) = &queue {
            if name.is_empty() {
                return Err(ConfigurationError::EmptyQueue { signal });
            }
        }
        arguments.validate(&signal)?;

        let descriptors = self.signals.entry(signal.clone()).or_default();
        descriptors.push(Arc::new(HandlerDescriptor {
            signal,
            index: descriptors.len(),
            predicate,
            queue,
            arguments,
            handler,
        }));
        Ok(())
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("signals", &self.signal_names())
            .finish()
    }
}

struct PendingRegistration {
    signal: String,
    predicate: Arc<dyn Predicate>,
    queue: QueueSelector,
    arguments: ArgumentSpec,
    handler: Arc<dyn SignalHandler>,
}

/// Builder returned by [`SignalRegistry::signal`]; finished by
/// [`Registration::handler`].
pub struct Registration<'a> {
    registry: &'a mut SignalRegistry,
    signal: String,
    predicate: Arc<dyn Predicate>,
    queue: QueueSelector,
    arguments: ArgumentSpec,
}

impl<'a> Registration<'a> {
    pub fn allowed(mut self, predicate: impl Predicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn queue(mut self, queue: impl Into<QueueSelector>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn arguments(mut self, arguments: ArgumentSpec) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn handler(self, handler: impl SignalHandler + 'static) -> Result<(), ConfigurationError> {
        self.registry.insert(PendingRegistration {
            signal: self.signal,
            predicate: self.predicate,
            queue: self.queue,
            arguments: self.arguments,
            handler: Arc::new(handler),
        })
    }
}

fn is_valid_signal_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserIdentity;
    use crate::message::args;
    use serde_json::json;

    fn noop() -> impl SignalHandler {
        handler_fn(|_call: SignalCall| async { Ok(()) })
    }

    #[test]
    fn handlers_keep_registration_order() {
        let mut registry = SignalRegistry::new();
        registry.register("blog.saved", noop(), everyone(), "fast").unwrap();
        registry.register("blog.saved", noop(), server_side(), "slow").unwrap();

        let descriptors = registry.resolve("blog.saved");
        assert_eq!(descriptors.len(), 2);
        let context = WindowContext::server();
        assert_eq!(descriptors[0].queue_for(&context, &Arguments::new()), "fast");
        assert_eq!(descriptors[1].queue_for(&context, &Arguments::new()), "slow");
        assert_eq!(descriptors[1].index(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_signals_resolve_to_nothing() {
        let registry = SignalRegistry::new();
        assert!(registry.resolve("missing").is_empty());
        assert!(registry.descriptor("missing", 0).is_none());
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        let mut registry = SignalRegistry::new();
        for name in ["", "1abc", "a..b", "a.", "a-b", "a b"] {
            assert_eq!(
                registry.register(name, noop(), everyone(), "q"),
                Err(ConfigurationError::InvalidSignalName(name.to_string()))
            );
        }
        assert!(matches!(
            registry.register("ok", noop(), everyone(), ""),
            Err(ConfigurationError::EmptyQueue { .. })
        ));
        assert!(matches!(
            registry
                .signal("ok")
                .arguments(ArgumentSpec::default().required("to", ArgumentKind::Any))
                .handler(noop()),
            Err(ConfigurationError::ReservedArgument { .. })
        ));
        assert!(matches!(
            registry
                .signal("ok")
                .arguments(
                    ArgumentSpec::default()
                        .required("id", ArgumentKind::Integer)
                        .optional("id", ArgumentKind::Any)
                )
                .handler(noop()),
            Err(ConfigurationError::DuplicateArgument { .. })
        ));
        assert!(registry.is_empty());
        registry.register("_private.sig_2", noop(), everyone(), "q").unwrap();
    }

    #[test]
    fn builtin_predicates() {
        let anonymous = WindowContext::for_connection("c1");
        let member = anonymous.clone().with_user(UserIdentity::new("1").with_perm("blog.edit"));
        let staff = anonymous.clone().with_user(UserIdentity::new("2").staff());
        let root = anonymous.clone().with_user(UserIdentity::new("3").superuser());

        let allows = |predicate: &dyn Predicate, context: &WindowContext| predicate.allows(context).unwrap();

        assert!(!allows(&server_side(), &root));
        assert!(allows(&everyone(), &anonymous));
        assert!(allows(&is_anonymous(), &anonymous));
        assert!(!allows(&is_anonymous(), &member));
        assert!(allows(&is_authenticated(), &member));
        assert!(!allows(&is_staff(), &member));
        assert!(allows(&is_staff(), &staff));
        assert!(!allows(&is_superuser(), &staff));
        assert!(allows(&is_superuser(), &root));
        assert!(allows(&has_perm("blog.edit"), &member));
        assert!(!allows(&has_perm("blog.edit"), &staff));
        assert!(allows(&has_perm("blog.edit"), &root));
    }

    #[test]
    fn failing_predicates_deny_only_themselves() {
        let mut registry = SignalRegistry::new();
        registry
            .signal("s")
            .allowed(predicate_fn(|_| Err(PredicateError::new("backend down"))))
            .handler(noop())
            .unwrap();
        registry
            .signal("s")
            .allowed(predicate_fn(|_| panic!("bug")))
            .handler(noop())
            .unwrap();
        registry.signal("s").allowed(everyone()).handler(noop()).unwrap();

        let context = WindowContext::server();
        let verdicts: Vec<bool> = registry
            .resolve("s")
            .iter()
            .map(|descriptor| registry.is_permitted(descriptor, &context))
            .collect();
        assert_eq!(verdicts, vec![false, false, true]);
    }

    #[test]
    fn expected_queues_include_dynamic_selectors() {
        let mut registry = SignalRegistry::new();
        registry.register("a", noop(), everyone(), "fast").unwrap();
        registry
            .signal("b")
            .queue(RandomQueue::new("shard-", 3))
            .handler(noop())
            .unwrap();
        registry.signal("c").handler(noop()).unwrap();

        let queues: Vec<String> = registry.expected_queues().into_iter().collect();
        assert_eq!(queues, vec!["default", "fast", "shard-0", "shard-1", "shard-2"]);

        let picked = registry.resolve("b")[0].queue_for(&WindowContext::server(), &Arguments::new());
        assert!(picked.starts_with("shard-"));
        assert_eq!(registry.signal_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn argument_spec_checks() {
        let spec = ArgumentSpec::strict()
            .required("id", ArgumentKind::Integer)
            .optional("mode", ArgumentKind::Choice(vec![json!("fast"), json!("slow")]));

        assert!(spec.check(&args(json!({"id": 4}))).is_ok());
        assert!(spec.check(&args(json!({"id": 4, "mode": "slow"}))).is_ok());
        assert_eq!(
            spec.check(&args(json!({}))),
            Err(ArgumentViolation::Missing("id".into()))
        );
        assert!(matches!(
            spec.check(&args(json!({"id": "4"}))),
            Err(ArgumentViolation::Invalid { .. })
        ));
        assert!(matches!(
            spec.check(&args(json!({"id": 4, "mode": "other"}))),
            Err(ArgumentViolation::Invalid { .. })
        ));
        assert_eq!(
            spec.check(&args(json!({"id": 4, "extra": true}))),
            Err(ArgumentViolation::Unexpected("extra".into()))
        );
        assert!(ArgumentSpec::default().check(&args(json!({"x": 1}))).is_ok());
    }
}
