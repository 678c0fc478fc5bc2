use serde_json::Value;

use crate::context::{ConnectionId, WindowContext};
use crate::error::UnserializableTopicError;
use crate::target::TopicValue;

/// Key every live connection is implicitly subscribed to.
pub const BROADCAST_TOPIC: &str = "-broadcast";

/// Identity key of a single connection.
pub fn window_topic(connection: &ConnectionId) -> String {
    format!("-window.{connection}")
}

/// Identity key shared by every connection of one user.
pub fn user_topic(user_id: &str) -> String {
    format!("-user.{user_id}")
}

/// Keys derived from a connection's identity rather than chosen by the
/// application. They are recomputed whenever a socket opens.
pub fn is_identity_key(key: &str) -> bool {
    key == BROADCAST_TOPIC || key.starts_with("-window.") || key.starts_with("-user.")
}

/// Turns an application value into a canonical topic key.
///
/// Implementations must be deterministic: equal inputs give equal keys across
/// processes, since subscriptions and triggers may be serialized on different
/// hosts.
pub trait TopicSerializer: Send + Sync {
    fn serialize(
        &self,
        context: &WindowContext,
        topic: &TopicValue,
    ) -> Result<String, UnserializableTopicError>;
}

/// Plain strings are used as keys verbatim. Typed values get a `-<type>.`
/// prefix, which is why plain strings may not start with `-`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTopicSerializer;

impl TopicSerializer for DefaultTopicSerializer {
    fn serialize(
        &self,
        _context: &WindowContext,
        topic: &TopicValue,
    ) -> Result<String, UnserializableTopicError> {
        let fail = |reason: &'static str| UnserializableTopicError {
            topic: topic.to_string(),
            reason,
        };
        match topic {
            TopicValue::Str(value) => plain_key(value).map_err(fail),
            TopicValue::Record { kind, id } => {
                if kind.is_empty() || id.is_empty() {
                    return Err(fail("records need a kind and an id"));
                }
                Ok(format!("-{kind}.{id}"))
            }
            TopicValue::Session(key) => {
                if key.is_empty() {
                    return Err(fail("session key is empty"));
                }
                Ok(format!("-session.{key}"))
            }
            TopicValue::Value(value) => match value {
                Value::String(value) => plain_key(value).map_err(fail),
                Value::Bool(value) => Ok(format!("-bool.{value}")),
                Value::Number(number) if number.is_f64() => Ok(format!("-float.{number}")),
                Value::Number(number) => Ok(format!("-int.{number}")),
                Value::Null => Err(fail("null has no topic key")),
                Value::Array(_) | Value::Object(_) => {
                    Err(fail("lists and maps have no topic key"))
                }
            },
        }
    }
}

fn plain_key(value: &str) -> Result<String, &'static str> {
    if value.is_empty() {
        Err("topic is empty")
    } else if value.starts_with('-') {
        Err("a leading '-' is reserved for typed topics")
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(topic: TopicValue) -> Result<String, UnserializableTopicError> {
        DefaultTopicSerializer.serialize(&WindowContext::server(), &topic)
    }

    #[test]
    fn strings_are_used_verbatim() {
        assert_eq!(key("blog:42".into()).unwrap(), "blog:42");
        assert_eq!(key(json!("blog:42").into()).unwrap(), "blog:42");
    }

    #[test]
    fn typed_values_get_prefixes() {
        let record = TopicValue::Record {
            kind: "blog.post".into(),
            id: "7".into(),
        };
        assert_eq!(key(record).unwrap(), "-blog.post.7");
        assert_eq!(key(TopicValue::Session("s1".into())).unwrap(), "-session.s1");
        assert_eq!(key(json!(12).into()).unwrap(), "-int.12");
        assert_eq!(key(json!(1.5).into()).unwrap(), "-float.1.5");
        assert_eq!(key(json!(true).into()).unwrap(), "-bool.true");
    }

    #[test]
    fn containers_and_reserved_strings_fail() {
        assert!(key(json!(null).into()).is_err());
        assert!(key(json!([1]).into()).is_err());
        assert!(key(json!({"a": 1}).into()).is_err());
        assert!(key("-window.x".into()).is_err());
        assert!(key("".into()).is_err());
    }

    #[test]
    fn identity_keys() {
        assert_eq!(window_topic(&ConnectionId::from("c1")), "-window.c1");
        assert_eq!(user_topic("7"), "-user.7");
        assert!(is_identity_key("-user.7"));
        assert!(is_identity_key(&window_topic(&ConnectionId::from("c1"))));
        assert!(is_identity_key(BROADCAST_TOPIC));
        assert!(!is_identity_key("blog:42"));
        assert!(!is_identity_key("-session.s1"));
    }
}
