//! JSON messages written to WebSocket push channels.
//!
//! Every message carries a `type` discriminator and an RFC-3339 timestamp.
//! A channel always finishes with exactly one `end` or `error` message.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushKind {
    Connected,
    Log,
    Progress,
    Metrics,
    Telemetry,
    Error,
    End,
    Info,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl PushEvent {
    fn new(kind: PushKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data: None,
            message: None,
            error_kind: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn connected(message: impl Into<String>) -> Self {
        Self::new(PushKind::Connected).with_message(message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(PushKind::Info).with_message(message)
    }

    pub fn end(message: impl Into<String>) -> Self {
        Self::new(PushKind::End).with_message(message)
    }

    /// A data-bearing event (`log`, `progress`, `metrics` or `telemetry`).
    pub fn item<T: Serialize>(kind: PushKind, item: &T) -> Result<Self> {
        let mut event = Self::new(kind);
        event.data = Some(serde_json::to_value(item)?);
        Ok(event)
    }

    pub fn error(error: &AppError) -> Self {
        let mut event = Self::new(PushKind::Error).with_message(error.to_string());
        event.error_kind = Some(error.kind());
        event
    }

    /// Error whose cause only survives as text, such as a failed install.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(PushKind::Error).with_message(reason)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, PushKind::End | PushKind::Error)
    }

    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Status;

    #[test]
    fn test_wire_shape() {
        let event = PushEvent::item(PushKind::Log, &serde_json::json!({"text": "hello\n"})).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["text"], "hello\n");
        assert!(json.get("message").is_none());

        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_error_carries_kind() {
        let error = AppError::from_status(Status::unavailable("node down"));
        let json = serde_json::to_value(PushEvent::error(&error)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["errorKind"], "connectivity");
        assert!(PushEvent::error(&error).is_terminal());
        assert!(!PushEvent::connected("hi").is_terminal());
    }
}
