//! Decoding of the agent's `--output-format stream-json` output.
//!
//! Every stdout line is either a JSON object (one agent event) or noise that
//! is passed through as `raw`. Stderr is never parsed. Nothing in here can
//! fail: a corrupted line degrades to a `raw` envelope.

use serde_json::{Map, Value};

use crate::EventEnvelope;

const FORWARDED_LIFECYCLE_EVENTS: [&str; 3] = ["message_start", "message_stop", "content_block_start"];

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// Envelope to forward to the caller, if the line maps to one.
    pub envelope: Option<EventEnvelope>,
    /// The parsed object, kept for session discovery.
    pub object: Option<Map<String, Value>>,
}

pub fn decode_stdout_line(line: &str) -> DecodedLine {
    let object = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => object,
        _ => {
            return DecodedLine {
                envelope: Some(EventEnvelope::raw(line)),
                object: None,
            }
        }
    };

    let envelope = match object.get("type").and_then(Value::as_str) {
        Some("stream_event") => stream_event_to_envelope(&object),
        Some("result") => Some(EventEnvelope::result(object.clone())),
        Some("system") => Some(EventEnvelope::system(object.clone())),
        _ => None,
    };

    DecodedLine {
        envelope,
        object: Some(object),
    }
}

pub fn decode_stderr_line(line: &str) -> EventEnvelope {
    EventEnvelope::stderr(line)
}

fn stream_event_to_envelope(object: &Map<String, Value>) -> Option<EventEnvelope> {
    let event = object.get("event")?;
    let event_type = event.get("type").and_then(Value::as_str)?;

    if event_type == "content_block_delta" {
        let delta = event.get("delta")?;
        if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
            return None;
        }
        let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
        return Some(EventEnvelope::text_delta(text));
    }

    if FORWARDED_LIFECYCLE_EVENTS.contains(&event_type) {
        return Some(EventEnvelope::claude_event(event_type));
    }

    None
}

/// Everything observed during one agent turn.
#[derive(Debug, Default)]
pub struct TurnTranscript {
    objects: Vec<Map<String, Value>>,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl TurnTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one stdout line, records it and returns the envelope to forward.
    pub fn push_stdout(&mut self, line: String) -> Option<EventEnvelope> {
        let decoded = decode_stdout_line(&line);
        if let Some(object) = decoded.object {
            self.objects.push(object);
        }
        self.stdout.push(line);
        decoded.envelope
    }

    pub fn push_stderr(&mut self, line: String) -> EventEnvelope {
        let envelope = decode_stderr_line(&line);
        self.stderr.push(line);
        envelope
    }

    pub fn objects(&self) -> &[Map<String, Value>] {
        &self.objects
    }

    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout
    }

    pub fn stderr_lines(&self) -> &[String] {
        &self.stderr
    }

    /// The agent-assigned session id. A `result` record is authoritative;
    /// otherwise the most recent record carrying a `session_id` wins.
    pub fn session_id(&self) -> Option<String> {
        let mut fallback = None;
        for object in &self.objects {
            let session_id = object.get("session_id").and_then(Value::as_str);
            if object.get("type").and_then(Value::as_str) == Some("result") {
                if let Some(session_id) = session_id {
                    return Some(session_id.to_string());
                }
                continue;
            }
            if let Some(session_id) = session_id {
                fallback = Some(session_id.to_string());
            }
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use serde_json::json;

    fn stdout_envelope(line: &str) -> Option<EventEnvelope> {
        decode_stdout_line(line).envelope
    }

    #[test]
    fn malformed_lines_become_raw() {
        let lines = [
            "",
            "not json at all",
            "{\"type\": \"stream_event\", \"event\": {",
            "[1, 2, 3]",
            "42",
            "\"quoted\"",
            "npm WARN deprecated",
        ];
        for line in lines {
            let decoded = decode_stdout_line(line);
            let envelope = decoded.envelope.expect("raw envelope");
            assert_eq!(envelope.kind, EventKind::Raw, "line: {line:?}");
            assert_eq!(envelope.get_str("data"), Some(line));
            assert!(decoded.object.is_none());
        }
    }

    #[test]
    fn text_delta_keeps_text_verbatim() {
        let text = "  héllo \"world\"\n\t🚀 ";
        let line = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }
        })
        .to_string();

        let envelope = stdout_envelope(&line).expect("text delta");
        assert_eq!(envelope.kind, EventKind::TextDelta);
        assert_eq!(envelope.get_str("text"), Some(text));
        assert_eq!(envelope.payload.len(), 1);
    }

    #[test]
    fn non_text_deltas_are_not_forwarded() {
        let line = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": {"type": "input_json_delta", "partial_json": "{\"a\""}
            }
        })
        .to_string();
        let decoded = decode_stdout_line(&line);
        assert!(decoded.envelope.is_none());
        assert!(decoded.object.is_some());
    }

    #[test]
    fn lifecycle_events_are_reduced_to_their_type() {
        for event_type in ["message_start", "message_stop", "content_block_start"] {
            let line = json!({
                "type": "stream_event",
                "event": {"type": event_type, "message": {"id": "msg_1", "content": []}}
            })
            .to_string();
            let envelope = stdout_envelope(&line).expect("claude event");
            assert_eq!(envelope.kind, EventKind::ClaudeEvent);
            assert_eq!(envelope.get_str("event_type"), Some(event_type));
            assert!(envelope.get("message").is_none());
        }

        let line = json!({"type": "stream_event", "event": {"type": "content_block_stop"}})
            .to_string();
        assert!(stdout_envelope(&line).is_none());
    }

    #[test]
    fn result_and_system_carry_the_full_record() {
        let result = json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": "Done.",
            "session_id": "sid-1"
        });
        let envelope = stdout_envelope(&result.to_string()).expect("result");
        assert_eq!(envelope.kind, EventKind::Result);
        assert_eq!(envelope.get("result"), Some(&result));

        let system = json!({"type": "system", "subtype": "init", "session_id": "sid-1", "tools": ["Bash"]});
        let envelope = stdout_envelope(&system.to_string()).expect("system");
        assert_eq!(envelope.kind, EventKind::System);
        assert_eq!(envelope.get("data"), Some(&system));
    }

    #[test]
    fn stderr_is_never_parsed() {
        let line = r#"{"type":"result","session_id":"sid"}"#;
        let envelope = decode_stderr_line(line);
        assert_eq!(envelope.kind, EventKind::Stderr);
        assert_eq!(envelope.get_str("data"), Some(line));
    }

    #[test]
    fn transcript_prefers_result_session_id() {
        let mut transcript = TurnTranscript::new();
        transcript.push_stdout(json!({"type": "system", "session_id": "from-system"}).to_string());
        transcript.push_stdout(json!({"type": "result", "session_id": "from-result"}).to_string());
        transcript.push_stdout(json!({"type": "assistant", "session_id": "late"}).to_string());
        assert_eq!(transcript.session_id().as_deref(), Some("from-result"));
    }

    #[test]
    fn transcript_falls_back_to_latest_session_id() {
        let mut transcript = TurnTranscript::new();
        transcript.push_stdout("garbage".to_string());
        transcript.push_stdout(json!({"type": "system", "session_id": "first"}).to_string());
        transcript.push_stdout(json!({"type": "assistant", "session_id": "second"}).to_string());
        transcript.push_stdout(json!({"type": "result", "is_error": true}).to_string());
        assert_eq!(transcript.session_id().as_deref(), Some("second"));
        assert_eq!(transcript.objects().len(), 3);
        assert_eq!(transcript.stdout_lines().len(), 4);
    }

    #[test]
    fn transcript_without_session_id() {
        let mut transcript = TurnTranscript::new();
        let envelope = transcript.push_stderr("boom".to_string());
        assert_eq!(envelope.kind, EventKind::Stderr);
        assert_eq!(transcript.stderr_lines(), ["boom".to_string()]);
        assert!(transcript.session_id().is_none());
    }
}
