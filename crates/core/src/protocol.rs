//! Defines the JSON message protocol between the companion and the chat backend.

use crate::error::ProtocolError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Expression duration used when an `expression` frame does not carry one.
pub const DEFAULT_EXPRESSION_MS: u64 = 1_000;

/// Neutral valence/arousal used when an `affect` frame omits a value.
pub const NEUTRAL_AFFECT: f32 = 0.5;

/// Messages sent from the companion to the backend.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A recognized user utterance.
    Transcription { data: String },
    /// Announces the end of the chat, carrying the epoch-millis timestamp.
    EndChat { data: i64 },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // Both variants are plain strings/integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One parsed inbound frame. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub payload: Map<String, Value>,
    pub timestamp: Option<i64>,
}

impl Frame {
    /// Parses a raw text frame. The `type` field is lifted out of the payload.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(mut payload) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match payload.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        let timestamp = payload.get("time").and_then(|time| match time {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Ok(Self {
            kind,
            payload,
            timestamp,
        })
    }

    /// Interprets the frame according to its `type`.
    pub fn message(&self) -> ServerMessage {
        match self.kind.as_str() {
            "llm_response" => ServerMessage::LlmResponse {
                text: self
                    .payload
                    .get("data")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            "affect" => ServerMessage::Affect {
                valence: self.unit_value("valence"),
                arousal: self.unit_value("arousal"),
            },
            "expression" => ServerMessage::Expression {
                name: self
                    .payload
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or("NEUTRAL")
                    .to_string(),
                duration_ms: self
                    .payload
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_EXPRESSION_MS),
            },
            other => ServerMessage::Unknown(other.to_string()),
        }
    }

    fn unit_value(&self, key: &str) -> f32 {
        self.payload
            .get(key)
            .and_then(Value::as_f64)
            .map(|v| v.clamp(0.0, 1.0) as f32)
            .unwrap_or(NEUTRAL_AFFECT)
    }
}

/// Messages sent from the backend to the companion.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// An utterance from the language model.
    LlmResponse { text: Option<String> },
    /// Valence/arousal values for the face.
    Affect { valence: f32, arousal: f32 },
    /// A named facial expression held for a while.
    Expression { name: String, duration_ms: u64 },
    /// Any other `type`; ignored.
    Unknown(String),
}
