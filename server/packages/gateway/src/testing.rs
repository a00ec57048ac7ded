//! In-memory gateway with scripted command replies, for tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;

use crate::{
    CapabilityGateway, CommandResult, CreateSandbox, GatewayError, GatewayFuture, OutputLine,
    RunOptions, SandboxGateway, SandboxHandle,
};

const SCRIPTED_HOME: &str = "/home/user";

#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub delay: Duration,
}

impl ScriptedReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn stdout_line(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    pub fn stderr_line(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<(String, ScriptedReply)>,
    sandboxes: HashSet<String>,
    exposed_ports: BTreeSet<u16>,
    capability_gateway: Option<CapabilityGateway>,
    create_failure: Option<String>,
    created: Vec<CreateSandbox>,
    connected: Vec<String>,
    commands: Vec<String>,
    files: Vec<(String, String)>,
}

/// Replies to each command with the first rule whose pattern is a substring
/// of it, or with a silent success when no rule matches.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGateway {
    state: Arc<StdMutex<ScriptState>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, pattern: impl Into<String>, reply: ScriptedReply) -> Self {
        self.lock().rules.push((pattern.into(), reply));
        self
    }

    pub fn with_exposed_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.lock().exposed_ports.extend(ports);
        self
    }

    pub fn with_capability_gateway(self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.lock().capability_gateway = Some(CapabilityGateway {
            url: url.into(),
            token: token.into(),
        });
        self
    }

    pub fn failing_create(self, message: impl Into<String>) -> Self {
        self.lock().create_failure = Some(message.into());
        self
    }

    /// Registers a sandbox that can be connected to without being created.
    pub fn with_sandbox(self, sandbox_id: impl Into<String>) -> Self {
        self.lock().sandboxes.insert(sandbox_id.into());
        self
    }

    pub fn created(&self) -> Vec<CreateSandbox> {
        self.lock().created.clone()
    }

    pub fn connected(&self) -> Vec<String> {
        self.lock().connected.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn files(&self) -> Vec<(String, String)> {
        self.lock().files.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, sandbox_id: String) -> Arc<dyn SandboxHandle> {
        Arc::new(ScriptedSandbox {
            id: sandbox_id,
            gateway: self.clone(),
        })
    }
}

impl SandboxGateway for ScriptedGateway {
    fn create(&self, request: CreateSandbox) -> GatewayFuture<'_, Arc<dyn SandboxHandle>> {
        async move {
            let sandbox_id = {
                let mut state = self.lock();
                if let Some(message) = state.create_failure.clone() {
                    return Err(GatewayError::Provider(message));
                }
                state.created.push(request);
                let sandbox_id = format!("sbx-{}", state.created.len());
                state.sandboxes.insert(sandbox_id.clone());
                sandbox_id
            };
            Ok(self.handle(sandbox_id))
        }
        .boxed()
    }

    fn connect<'a>(&'a self, sandbox_id: &'a str) -> GatewayFuture<'a, Arc<dyn SandboxHandle>> {
        async move {
            {
                let mut state = self.lock();
                state.connected.push(sandbox_id.to_string());
                if !state.sandboxes.contains(sandbox_id) {
                    return Err(GatewayError::NotFound {
                        sandbox_id: sandbox_id.to_string(),
                    });
                }
            }
            Ok(self.handle(sandbox_id.to_string()))
        }
        .boxed()
    }
}

struct ScriptedSandbox {
    id: String,
    gateway: ScriptedGateway,
}

impl ScriptedSandbox {
    async fn reply(&self, command: &str, options: RunOptions) -> Result<CommandResult, GatewayError> {
        let reply = {
            let mut state = self.gateway.lock();
            state.commands.push(command.to_string());
            state
                .rules
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_default()
        };

        if reply.delay > options.timeout {
            tokio::time::sleep(options.timeout).await;
            return Err(GatewayError::Timeout {
                command: command.to_string(),
                timeout_ms: options.timeout.as_millis() as u64,
            });
        }
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        if let Some(output) = &options.output {
            for line in &reply.stdout {
                let _ = output.send(OutputLine::Stdout(line.clone()));
            }
            for line in &reply.stderr {
                let _ = output.send(OutputLine::Stderr(line.clone()));
            }
        }

        Ok(CommandResult {
            exit_code: reply.exit_code,
            stdout: join_lines(&reply.stdout),
            stderr: join_lines(&reply.stderr),
        })
    }
}

impl SandboxHandle for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn home_dir(&self) -> &str {
        SCRIPTED_HOME
    }

    fn run<'a>(&'a self, command: &'a str, options: RunOptions) -> GatewayFuture<'a, CommandResult> {
        self.reply(command, options).boxed()
    }

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> GatewayFuture<'a, ()> {
        async move {
            self.gateway
                .lock()
                .files
                .push((path.to_string(), content.to_string()));
            Ok(())
        }
        .boxed()
    }

    fn exposed_url(&self, port: u16) -> Option<String> {
        if self.gateway.lock().exposed_ports.contains(&port) {
            Some(format!("https://{port}-{}.sandbox.test", self.id))
        } else {
            None
        }
    }

    fn capability_gateway(&self) -> GatewayFuture<'_, Option<CapabilityGateway>> {
        async move { Ok(self.gateway.lock().capability_gateway.clone()) }.boxed()
    }
}

fn join_lines(lines: &[String]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}
