//! Shared building blocks for Tideline.
//!
//! A [`registry::SignalRegistry`] maps signal names to server-side handlers.
//! The [`dispatch::Dispatcher`] fans a trigger out to its targets: handlers
//! are enqueued on a [`executor::QueueExecutor`], while window, user, topic and
//! broadcast targets are pushed through a [`dispatch::Delivery`]. Topic targets
//! are resolved through a [`cache::TopicCache`].

pub mod cache;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod message;
pub mod registry;
pub mod target;
pub mod testing;
pub mod token;
pub mod topic;
pub mod worker;

pub use cache::{subscription_keys, MemoryTopicCache, TopicCache};
pub use context::{
    is_valid_window_key, ConnectionId, ConnectionRequest, ContextDraft, ContextPipeline,
    ContextStep, LocaleStep, SessionStep, SignedUserStep, UserAgentStep, UserIdentity,
    WindowContext, WindowKeyStep, DEFAULT_LOCALE, DEFAULT_SESSION_COOKIE,
};
pub use dispatch::{Delivery, Dispatcher, TriggerReport};
pub use error::{
    ArgumentViolation, AuthenticationError, ConfigurationError, ExecutorError, PredicateError,
    TargetError, TokenError, TriggerError, UnserializableTopicError,
};
pub use executor::{JobReceiver, LocalExecutor, QueueExecutor, SignalJob};
pub use message::{args, Arguments, SignalMessage, RESERVED_ARGUMENTS};
pub use registry::{
    everyone, handler_fn, has_perm, is_anonymous, is_authenticated, is_staff, is_superuser,
    predicate_fn, server_side, ArgumentKind, ArgumentSpec, DynamicQueue, HandlerDescriptor,
    Predicate, QueueSelector, RandomQueue, Registration, SignalCall, SignalHandler,
    SignalRegistry, DEFAULT_QUEUE,
};
pub use target::{Target, TopicValue};
pub use token::{UserTokenClaims, UserTokenSigner};
pub use topic::{
    is_identity_key, user_topic, window_topic, DefaultTopicSerializer, TopicSerializer,
    BROADCAST_TOPIC,
};
pub use worker::{JobOutcome, JobRunner, PoolConfig, WorkerPool};
