//! Typed runtime events and the pluggable sink they are published to.
//!
//! Toolsets and the scheduler publish `EventPayload` values through the
//! runtime; external UI layers adapt the stream however they like. The
//! serialized log form is line-delimited JSON, one event per line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::toolset::Capability;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    UserMessage {
        content: String,
    },
    TextResponseDelta {
        partial: String,
    },
    TextResponseComplete {
        full: String,
    },
    ToolCall {
        tool: String,
        args: Value,
        call_id: String,
    },
    ToolResult {
        call_id: String,
        result: String,
        #[serde(default)]
        truncated: bool,
    },
    ApprovalRequested {
        tool: String,
        args: Value,
        description: String,
        capabilities: Vec<Capability>,
    },
    Error {
        #[serde(rename = "error_kind")]
        kind: String,
        message: String,
    },
}

/// Envelope published to the sink: the payload plus the emitting frame's
/// agent name and depth, stamped at publication time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub depth: u32,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RuntimeEvent {
    pub fn new(agent: impl Into<String>, depth: u32, payload: EventPayload) -> Self {
        Self {
            ts: Utc::now(),
            agent: agent.into(),
            depth,
            payload,
        }
    }

    /// One-line JSON form for log shipping. Attachment contents are never
    /// inlined; events reference them by path.
    pub fn to_log_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"kind\":\"error\",\"message\":\"event serialization failed: {e}\"}}"
            )
        })
    }
}

/// The pluggable event consumer.
///
/// Publication sits on the call path: implementations must enqueue and
/// return promptly rather than blocking on rendering or I/O.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: RuntimeEvent);
}

/// Sink that discards everything.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn on_event(&self, _event: RuntimeEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_shape() {
        let event = RuntimeEvent::new(
            "greeter",
            0,
            EventPayload::UserMessage {
                content: "hi".to_string(),
            },
        );
        let line = event.to_log_line();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["agent"], "greeter");
        assert_eq!(parsed["depth"], 0);
        assert_eq!(parsed["kind"], "user_message");
        assert_eq!(parsed["content"], "hi");
        assert!(parsed["ts"].is_string());
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = EventPayload::ToolCall {
            tool: "read_file".to_string(),
            args: serde_json::json!({"path": "a.txt"}),
            call_id: "c1".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        match back {
            EventPayload::ToolCall { tool, call_id, .. } => {
                assert_eq!(tool, "read_file");
                assert_eq!(call_id, "c1");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
