use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub mod decoder;

pub use decoder::{decode_stderr_line, decode_stdout_line, DecodedLine, TurnTranscript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    TextDelta,
    ClaudeEvent,
    System,
    Result,
    Stderr,
    Raw,
    Ports,
    McpConfigured,
    RouterReady,
    Warning,
    Error,
    Complete,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::TextDelta => "text_delta",
            Self::ClaudeEvent => "claude_event",
            Self::System => "system",
            Self::Result => "result",
            Self::Stderr => "stderr",
            Self::Raw => "raw",
            Self::Ports => "ports",
            Self::McpConfigured => "mcp_configured",
            Self::RouterReady => "router_ready",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Done => "done",
        }
    }
}

/// One record on the outgoing stream.
///
/// Serializes flat: `{"type": "<kind>", ...payload}`. The payload never
/// carries its own `type` key so every envelope round-trips on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(flatten, default)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != "type" {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::new(EventKind::Status).with("status", status.into())
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::new(EventKind::TextDelta).with("text", text.into())
    }

    pub fn claude_event(event_type: impl Into<String>) -> Self {
        Self::new(EventKind::ClaudeEvent).with("event_type", event_type.into())
    }

    pub fn system(data: Map<String, Value>) -> Self {
        Self::new(EventKind::System).with("data", Value::Object(data))
    }

    pub fn result(result: Map<String, Value>) -> Self {
        Self::new(EventKind::Result).with("result", Value::Object(result))
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::new(EventKind::Stderr).with("data", line.into())
    }

    pub fn raw(line: impl Into<String>) -> Self {
        Self::new(EventKind::Raw).with("data", line.into())
    }

    pub fn ports(exposed_urls: &BTreeMap<u16, String>) -> Self {
        Self::new(EventKind::Ports).with("exposed_urls", exposed_urls_value(exposed_urls))
    }

    pub fn mcp_configured(enabled: &[String], gateway_url: impl Into<String>) -> Self {
        Self::new(EventKind::McpConfigured)
            .with("mcp_enabled", enabled.to_vec())
            .with("mcp_gateway_url", gateway_url.into())
    }

    pub fn router_ready(router_status: Value) -> Self {
        Self::new(EventKind::RouterReady).with("router_status", router_status)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning).with("message", message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error).with("error", message.into())
    }

    pub fn complete() -> Self {
        Self::new(EventKind::Complete)
    }

    pub fn done() -> Self {
        Self::new(EventKind::Done)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Done
    }
}

/// JSON object keys must be strings, so port numbers are rendered as text.
pub fn exposed_urls_value(exposed_urls: &BTreeMap<u16, String>) -> Value {
    Value::Object(
        exposed_urls
            .iter()
            .map(|(port, url)| (port.to_string(), Value::String(url.clone())))
            .collect(),
    )
}
