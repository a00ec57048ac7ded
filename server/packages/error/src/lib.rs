use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SessionNotFound,
    SandboxCreateFailed,
    SandboxConnectFailed,
    SetupFailed,
    SubtaskFailed,
    CommandFailed,
    Timeout,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:sandbox-relay:error:invalid_request",
            Self::SessionNotFound => "urn:sandbox-relay:error:session_not_found",
            Self::SandboxCreateFailed => "urn:sandbox-relay:error:sandbox_create_failed",
            Self::SandboxConnectFailed => "urn:sandbox-relay:error:sandbox_connect_failed",
            Self::SetupFailed => "urn:sandbox-relay:error:setup_failed",
            Self::SubtaskFailed => "urn:sandbox-relay:error:subtask_failed",
            Self::CommandFailed => "urn:sandbox-relay:error:command_failed",
            Self::Timeout => "urn:sandbox-relay:error:timeout",
            Self::StreamError => "urn:sandbox-relay:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SessionNotFound => "Session Not Found",
            Self::SandboxCreateFailed => "Sandbox Create Failed",
            Self::SandboxConnectFailed => "Sandbox Connect Failed",
            Self::SetupFailed => "Setup Failed",
            Self::SubtaskFailed => "Subtask Failed",
            Self::CommandFailed => "Command Failed",
            Self::Timeout => "Timeout",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SessionNotFound => 404,
            Self::SandboxCreateFailed => 502,
            Self::SandboxConnectFailed => 502,
            Self::SetupFailed => 500,
            Self::SubtaskFailed => 500,
            Self::CommandFailed => 502,
            Self::Timeout => 504,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("failed to create sandbox: {message}")]
    SandboxCreateFailed { message: String },
    #[error("failed to connect to sandbox {sandbox_id}: {message}")]
    SandboxConnectFailed { sandbox_id: String, message: String },
    #[error("{step} failed with exit code {exit_code}")]
    SetupFailed {
        step: String,
        exit_code: i32,
        output: Option<String>,
    },
    #[error("{message}")]
    SubtaskFailed { message: String, reported: bool },
    #[error("command failed: {message}")]
    CommandFailed { message: String },
    #[error("timed out: {message}")]
    Timeout { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SandboxCreateFailed { .. } => ErrorType::SandboxCreateFailed,
            Self::SandboxConnectFailed { .. } => ErrorType::SandboxConnectFailed,
            Self::SetupFailed { .. } => ErrorType::SetupFailed,
            Self::SubtaskFailed { .. } => ErrorType::SubtaskFailed,
            Self::CommandFailed { .. } => ErrorType::CommandFailed,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// True when an `error` event describing this failure has already been
    /// put on the stream by the component that raised it.
    pub fn is_reported(&self) -> bool {
        matches!(self, Self::SubtaskFailed { reported: true, .. })
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::SandboxConnectFailed { sandbox_id, .. } => {
                extensions.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            Self::SetupFailed {
                step,
                exit_code,
                output,
            } => {
                extensions.insert("step".to_string(), Value::String(step.clone()));
                extensions.insert(
                    "exitCode".to_string(),
                    Value::Number(serde_json::Number::from(*exit_code as i64)),
                );
                if let Some(output) = output {
                    extensions.insert("output".to_string(), Value::String(output.clone()));
                }
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
