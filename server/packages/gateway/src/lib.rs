//! Remote execution gateway: the seam between the orchestrator and whatever
//! actually hosts sandboxes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sandbox_relay_error::RelayError;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use local::LocalGateway;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

pub type GatewayFuture<'a, T> = BoxFuture<'a, Result<T, GatewayError>>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("sandbox not found: {sandbox_id}")]
    NotFound { sandbox_id: String },
    #[error("failed to spawn `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture command {0}")]
    MissingPipe(&'static str),
    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<GatewayError> for RelayError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Timeout { .. } => RelayError::Timeout {
                message: value.to_string(),
            },
            other => RelayError::CommandFailed {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSandbox {
    pub template: String,
    pub timeout: Duration,
    /// Capability (MCP) servers the provider should expose through its gateway.
    pub capabilities: Map<String, Value>,
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// When set, every output line is pushed here as soon as it is read.
    pub output: Option<mpsc::UnboundedSender<OutputLine>>,
}

impl RunOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            output: None,
        }
    }

    pub fn streaming(mut self, output: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.output = Some(output);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr when present, stdout otherwise.
    pub fn output_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityGateway {
    pub url: String,
    pub token: String,
}

/// A live connection to one sandbox.
pub trait SandboxHandle: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Home directory of the sandbox user; relative paths resolve against it.
    fn home_dir(&self) -> &str;

    fn run<'a>(&'a self, command: &'a str, options: RunOptions) -> GatewayFuture<'a, CommandResult>;

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> GatewayFuture<'a, ()>;

    /// Externally reachable URL for `port`, if the provider exposes one.
    fn exposed_url(&self, port: u16) -> Option<String>;

    fn capability_gateway(&self) -> GatewayFuture<'_, Option<CapabilityGateway>>;
}

pub trait SandboxGateway: Send + Sync + 'static {
    fn create(&self, request: CreateSandbox) -> GatewayFuture<'_, Arc<dyn SandboxHandle>>;

    fn connect<'a>(&'a self, sandbox_id: &'a str) -> GatewayFuture<'a, Arc<dyn SandboxHandle>>;
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
