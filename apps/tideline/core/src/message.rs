use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyword arguments of a signal.
pub type Arguments = Map<String, Value>;

/// Argument names callers may not use; they carry routing metadata.
pub const RESERVED_ARGUMENTS: [&str; 4] = ["window_info", "signal_name", "to", "signal_id"];

/// Builds [`Arguments`] from a JSON value. Anything but an object yields an
/// empty map.
pub fn args(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn reserved_argument(arguments: &Arguments) -> Option<&str> {
    arguments
        .keys()
        .map(String::as_str)
        .find(|key| RESERVED_ARGUMENTS.contains(key))
}

/// A wire frame in either direction.
///
/// Client frames carry no `signal_id`. Server frames always carry the id of
/// the trigger that produced them so clients can drop re-deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub signal: String,
    #[serde(default)]
    pub opts: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
}

impl SignalMessage {
    pub fn new(signal: impl Into<String>, opts: Arguments) -> Self {
        Self {
            signal: signal.into(),
            opts,
            signal_id: None,
        }
    }

    pub fn with_signal_id(mut self, signal_id: impl Into<String>) -> Self {
        self.signal_id = Some(signal_id.into());
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
