#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sandbox_relay::{Orchestrator, RelayConfig, RunRequest, SessionRegistry};
use sandbox_relay_event_schema::{EventEnvelope, EventKind};
use sandbox_relay_gateway::testing::{ScriptedGateway, ScriptedReply};

pub const AGENT_MARKER: &str = "--output-format stream-json";
pub const SESSION_ID: &str = "sid-0a1b2c";

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.execution_poll = Duration::from_millis(10);
    config.router.poll_interval = Duration::from_millis(10);
    config.router.settle_delay = Duration::ZERO;
    config
}

pub fn agent_turn(session_id: &str, text: &str) -> ScriptedReply {
    ScriptedReply::ok()
        .stdout_line(format!(
            r#"{{"type":"system","subtype":"init","session_id":"{session_id}","cwd":"/home/user/template"}}"#
        ))
        .stdout_line(r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"msg_1"}}}"#)
        .stdout_line(format!(
            r#"{{"type":"stream_event","event":{{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{text}"}}}}}}"#
        ))
        .stdout_line("not json at all")
        .stdout_line(format!(
            r#"{{"type":"result","subtype":"success","is_error":false,"session_id":"{session_id}","result":"{text}"}}"#
        ))
        .stderr_line("npm warn deprecated")
}

pub fn router_listening() -> ScriptedReply {
    ScriptedReply::ok().stdout_line("tcp 0 0 0.0.0.0:3456 0.0.0.0:* LISTEN")
}

pub struct Harness {
    pub gateway: ScriptedGateway,
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(gateway: ScriptedGateway) -> Self {
        Self::with_config(gateway, test_config())
    }

    pub fn with_config(gateway: ScriptedGateway, config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(config),
            Arc::new(gateway.clone()),
            registry.clone(),
        ));
        Self {
            gateway,
            registry,
            orchestrator,
        }
    }

    pub async fn run(&self, session_id: Option<&str>, prompt: &str) -> Vec<EventEnvelope> {
        self.run_request(RunRequest {
            session_id: session_id.map(str::to_string),
            prompt: prompt.to_string(),
            repo: None,
        })
        .await
    }

    pub async fn run_request(&self, request: RunRequest) -> Vec<EventEnvelope> {
        let mut receiver = self.orchestrator.start(request);
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("event stream stalled")
        {
            events.push(event);
        }
        events
    }
}

pub fn kinds(events: &[EventEnvelope]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

pub fn statuses(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.kind == EventKind::Status)
        .filter_map(|event| event.get_str("status").map(str::to_string))
        .collect()
}

pub fn find(events: &[EventEnvelope], kind: EventKind) -> Option<&EventEnvelope> {
    events.iter().find(|event| event.kind == kind)
}

pub fn position(events: &[EventEnvelope], kind: EventKind) -> Option<usize> {
    events.iter().position(|event| event.kind == kind)
}

pub fn assert_ends_with_single_done(events: &[EventEnvelope]) {
    assert_eq!(events.last().map(|event| event.kind), Some(EventKind::Done));
    assert_eq!(
        events.iter().filter(|event| event.kind == EventKind::Done).count(),
        1
    );
}
