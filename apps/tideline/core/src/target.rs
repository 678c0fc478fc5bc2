use std::fmt;

use serde_json::Value;

/// Where a trigger should be delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Every permitted handler registered for the signal, through the queue executor.
    Server,
    /// Every permitted handler, run in place before the trigger returns.
    Sync,
    /// The connection that originated the context.
    Window,
    /// Every connection of the context's user.
    User,
    /// Every connection subscribed to the context's own session key.
    Session,
    /// Every open connection.
    Broadcast,
    /// Every connection subscribed to the topic's key.
    Topic(TopicValue),
}

/// Application value naming a topic. Turned into a key by a
/// [`crate::topic::TopicSerializer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TopicValue {
    Str(String),
    Record { kind: String, id: String },
    Session(String),
    Value(Value),
}

impl Target {
    pub fn topic(value: impl Into<TopicValue>) -> Self {
        Target::Topic(value.into())
    }

    pub fn record(kind: impl Into<String>, id: impl ToString) -> Self {
        Target::Topic(TopicValue::Record {
            kind: kind.into(),
            id: id.to_string(),
        })
    }

    /// Reads a target from its JSON form: the upper-case names of the
    /// reserved targets, or any other value as a topic.
    pub fn from_json(value: Value) -> Self {
        if let Value::String(name) = &value {
            match name.as_str() {
                "SERVER" => return Target::Server,
                "SYNC" => return Target::Sync,
                "SESSION" => return Target::Session,
                "WINDOW" => return Target::Window,
                "USER" => return Target::User,
                "BROADCAST" => return Target::Broadcast,
                _ => {}
            }
        }
        Target::Topic(TopicValue::from_json(value))
    }
}

impl TopicValue {
    /// `{"kind", "id"}` objects are records and `{"session"}` objects are
    /// sessions; strings stay strings and everything else is kept as is.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(value) => TopicValue::Str(value),
            Value::Object(map) => {
                if let (Some(Value::String(kind)), Some(id)) = (map.get("kind"), map.get("id")) {
                    let id = match id {
                        Value::String(id) => id.clone(),
                        other => other.to_string(),
                    };
                    return TopicValue::Record {
                        kind: kind.clone(),
                        id,
                    };
                }
                if let (1, Some(Value::String(key))) = (map.len(), map.get("session")) {
                    return TopicValue::Session(key.clone());
                }
                TopicValue::Value(Value::Object(map))
            }
            other => TopicValue::Value(other),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Server => f.write_str("SERVER"),
            Target::Sync => f.write_str("SYNC"),
            Target::Session => f.write_str("SESSION"),
            Target::Window => f.write_str("WINDOW"),
            Target::User => f.write_str("USER"),
            Target::Broadcast => f.write_str("BROADCAST"),
            Target::Topic(topic) => write!(f, "topic({topic})"),
        }
    }
}

impl fmt::Display for TopicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicValue::Str(value) => write!(f, "{value:?}"),
            TopicValue::Record { kind, id } => write!(f, "{kind}#{id}"),
            TopicValue::Session(key) => write!(f, "session {key}"),
            TopicValue::Value(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for TopicValue {
    fn from(value: &str) -> Self {
        TopicValue::Str(value.to_string())
    }
}

impl From<String> for TopicValue {
    fn from(value: String) -> Self {
        TopicValue::Str(value)
    }
}

impl From<Value> for TopicValue {
    fn from(value: Value) -> Self {
        TopicValue::Value(value)
    }
}

impl From<TopicValue> for Target {
    fn from(value: TopicValue) -> Self {
        Target::Topic(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_names_parse_to_reserved_targets() {
        assert_eq!(Target::from_json(json!("WINDOW")), Target::Window);
        assert_eq!(Target::from_json(json!("BROADCAST")), Target::Broadcast);
        assert_eq!(Target::from_json(json!("SYNC")), Target::Sync);
        assert_eq!(Target::from_json(json!("SESSION")), Target::Session);
        assert_eq!(Target::Sync.to_string(), "SYNC");
        assert_eq!(Target::from_json(json!("window")), Target::topic("window"));
    }

    #[test]
    fn objects_parse_to_records_and_sessions() {
        assert_eq!(
            Target::from_json(json!({"kind": "blog.post", "id": 42})),
            Target::record("blog.post", 42)
        );
        assert_eq!(
            Target::from_json(json!({"session": "abc"})),
            Target::Topic(TopicValue::Session("abc".into()))
        );
        assert_eq!(
            Target::from_json(json!(3)),
            Target::Topic(TopicValue::Value(json!(3)))
        );
    }
}
