use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use sandbox_relay_error::{ErrorType, ProblemDetails, RelayError};
use sandbox_relay_event_schema::{EventEnvelope, EventKind};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::orchestrator::{Orchestrator, RunRequest};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let v1 = Router::new()
        .route("/health", get(get_health))
        .route("/chat", post(post_chat))
        .route("/chat/:session", post(post_chat_session))
        .route("/openapi.json", get(get_openapi));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .nest("/v1", v1)
        .layer(trace_layer)
        .with_state(orchestrator)
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(orchestrator): State<Arc<Orchestrator>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: orchestrator.registry().len().await,
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream ending with a `done` event", content_type = "text/event-stream", body = EventEnvelope),
        (status = 400, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    start_chat(&orchestrator, None, request)
}

#[utoipa::path(
    post,
    path = "/v1/chat/{session}",
    request_body = ChatRequest,
    params(("session" = String, Path, description = "Session id reported by a previous run")),
    responses(
        (status = 200, description = "Event stream ending with a `done` event", content_type = "text/event-stream", body = EventEnvelope),
        (status = 400, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(session): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    start_chat(&orchestrator, Some(session), request)
}

fn start_chat(
    orchestrator: &Arc<Orchestrator>,
    session_id: Option<String>,
    request: ChatRequest,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = RunRequest {
        session_id,
        prompt: request.prompt,
        repo: request.repo.filter(|repo| !repo.trim().is_empty()),
    };
    request.validate()?;

    let stream = ReceiverStream::new(orchestrator.start(request))
        .map(|envelope| Ok::<Event, Infallible>(to_sse_event(&envelope)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn to_sse_event(envelope: &EventEnvelope) -> Event {
    Event::default()
        .json_data(envelope)
        .unwrap_or_else(|_| Event::default().data(r#"{"type":"raw"}"#))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, post_chat_session),
    components(schemas(
        HealthResponse,
        ChatRequest,
        EventEnvelope,
        EventKind,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Agent runs streamed as server-sent events")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}
