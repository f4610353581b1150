//! Server → viewer message envelopes
//!
//! Every frame sent to a viewer is a JSON object discriminated by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::BufferedMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Join confirmation, sent once per viewer
    Connected {
        message: String,
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    /// Buffered history, sent once per viewer on join when the buffer is non-empty
    History { data: Vec<BufferedMessage> },
    /// One inbound upstream message
    Message { data: Value, timestamp: i64 },
    /// Upstream activation failed during this viewer's join
    Error { message: String },
}

impl Envelope {
    #[must_use]
    pub fn connected(topic: &str) -> Self {
        Self::Connected {
            message: format!("Connected to stream {topic}"),
            stream_id: topic.to_string(),
        }
    }

    #[must_use]
    pub fn subscribe_failed() -> Self {
        Self::Error {
            message: "Failed to subscribe to upstream stream".to_string(),
        }
    }

    #[must_use]
    pub fn message(entry: &BufferedMessage) -> Self {
        Self::Message {
            data: entry.data.clone(),
            timestamp: entry.timestamp,
        }
    }

    #[must_use]
    pub const fn envelope_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::History { .. } => "history",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as the JSON text frame sent over the wire
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connected_wire_format() {
        let value = serde_json::to_value(Envelope::connected("a/b")).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["streamId"], "a/b");
        assert!(value["message"].as_str().unwrap().contains("a/b"));
    }

    #[test]
    fn test_history_wire_format() {
        let envelope = Envelope::History {
            data: vec![BufferedMessage {
                timestamp: 1_700_000_000_000,
                data: json!({"kwh": 3}),
            }],
        };
        let value = serde_json::to_value(envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "history",
                "data": [{"timestamp": 1_700_000_000_000_i64, "data": {"kwh": 3}}]
            })
        );
    }

    #[test]
    fn test_message_and_error_wire_format() {
        let entry = BufferedMessage {
            timestamp: 42,
            data: json!("raw"),
        };
        let value = serde_json::to_value(Envelope::message(&entry)).unwrap();
        assert_eq!(value, json!({"type": "message", "data": "raw", "timestamp": 42}));

        let value = serde_json::to_value(Envelope::subscribe_failed()).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value["message"].is_string());
    }
}
