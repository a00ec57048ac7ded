mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use sandbox_relay::build_router;
use sandbox_relay_event_schema::{EventEnvelope, EventKind};
use sandbox_relay_gateway::testing::ScriptedGateway;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::*;

fn app(harness: &Harness) -> Router {
    build_router(harness.orchestrator.clone())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn read_body(response: axum::response::Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

fn parse_sse(body: &str) -> Vec<EventEnvelope> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("envelope json"))
        .collect()
}

#[tokio::test]
async fn health_reports_ok() {
    let harness = Harness::new(ScriptedGateway::new());
    let response = app(&harness)
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&read_body(response).await).expect("json");
    assert_eq!(body, json!({"status": "ok", "sessions": 0}));
}

#[tokio::test]
async fn empty_prompt_is_a_problem_response() {
    let harness = Harness::new(ScriptedGateway::new());
    let response = app(&harness)
        .oneshot(post_json("/v1/chat", json!({"prompt": "  "})))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let problem: Value = serde_json::from_str(&read_body(response).await).expect("json");
    assert_eq!(problem["type"], "urn:sandbox-relay:error:invalid_request");
    assert_eq!(problem["status"], 400);
    assert!(harness.gateway.created().is_empty());
}

#[tokio::test]
async fn chat_streams_events_until_done() {
    let gateway = ScriptedGateway::new()
        .with_exposed_ports([5173])
        .on("grep :3456", router_listening())
        .on(AGENT_MARKER, agent_turn(SESSION_ID, "streamed"));
    let harness = Harness::new(gateway);

    let response = app(&harness)
        .oneshot(post_json("/v1/chat", json!({"prompt": "build it"})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let events = parse_sse(&read_body(response).await);
    assert_eq!(events.first().map(|event| event.kind), Some(EventKind::Status));
    assert_eq!(events.last().map(|event| event.kind), Some(EventKind::Done));

    let complete = events
        .iter()
        .find(|event| event.kind == EventKind::Complete)
        .expect("complete");
    assert_eq!(complete.get_str("session_id"), Some(SESSION_ID));
    assert_eq!(
        harness.registry.lookup(SESSION_ID).await.as_deref(),
        Some("sbx-1")
    );
}

#[tokio::test]
async fn unknown_session_streams_error_then_done() {
    let harness = Harness::new(ScriptedGateway::new());
    let response = app(&harness)
        .oneshot(post_json("/v1/chat/sid-unknown", json!({"prompt": "continue"})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let events = parse_sse(&read_body(response).await);
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![EventKind::Status, EventKind::Error, EventKind::Done]);
    assert!(harness.gateway.created().is_empty());
}

#[tokio::test]
async fn openapi_document_lists_chat_routes() {
    let harness = Harness::new(ScriptedGateway::new());
    let response = app(&harness)
        .oneshot(
            Request::builder()
                .uri("/v1/openapi.json")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let doc: Value = serde_json::from_str(&read_body(response).await).expect("json");
    assert!(doc["paths"]["/v1/chat"]["post"].is_object());
    assert!(doc["paths"]["/v1/chat/{session}"]["post"].is_object());
    assert!(doc["components"]["schemas"]["EventEnvelope"].is_object());
}
