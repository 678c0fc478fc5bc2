use serde_json::Value;
use thiserror::Error;

/// Raised while building a [`crate::registry::SignalRegistry`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid signal name {0:?}: expected dotted identifiers")]
    InvalidSignalName(String),
    #[error("signal {signal}: queue name must not be empty")]
    EmptyQueue { signal: String },
    #[error("signal {signal}: argument {argument:?} is declared twice")]
    DuplicateArgument { signal: String, argument: String },
    #[error("signal {signal}: argument {argument:?} uses a reserved name")]
    ReservedArgument { signal: String, argument: String },
}

/// A context step refused to build a window context for a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{step} rejected the connection: {reason}")]
pub struct AuthenticationError {
    pub step: &'static str,
    pub reason: String,
}

impl AuthenticationError {
    pub fn new(step: &'static str, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot derive a topic key from {topic}: {reason}")]
pub struct UnserializableTopicError {
    pub topic: String,
    pub reason: &'static str,
}

/// Validation failures detected before any target of a trigger is processed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("signal name must not be empty")]
    EmptySignalName,
    #[error("signal {0}: at least one target is required")]
    NoTargets(String),
    #[error("signal {signal}: argument {argument:?} collides with a reserved name")]
    ReservedArgument { signal: String, argument: String },
}

/// Per-target failure recorded in a [`crate::dispatch::TriggerReport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error(transparent)]
    Topic(#[from] UnserializableTopicError),
    #[error("queue {queue}: {reason}")]
    Executor { queue: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("queue {0} no longer accepts jobs")]
    Closed(String),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PredicateError(pub String);

impl PredicateError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Why a job's arguments did not satisfy its handler's argument spec.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ArgumentViolation {
    #[error("missing required argument {0:?}")]
    Missing(String),
    #[error("argument {name:?} has unexpected value {value}")]
    Invalid { name: String, value: Value },
    #[error("unexpected argument {0:?}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token payload is not valid: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("token signature mismatch")]
    Signature,
    #[error("token has expired")]
    Expired,
    #[error("signing key rejected")]
    Key,
}
