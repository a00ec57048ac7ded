//! Drives one chat request from sandbox acquisition to the final `done` event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_relay_error::RelayError;
use sandbox_relay_event_schema::{exposed_urls_value, EventEnvelope, TurnTranscript};
use sandbox_relay_gateway::{
    shell_quote, CommandResult, CreateSandbox, OutputLine, RunOptions, SandboxGateway,
    SandboxHandle,
};
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::multiplexer::{self, EventSink};
use crate::registry::{RecordOutcome, SessionRegistry};
use crate::router_setup::{preview, RouterSetup, RouterStatus};

const EVENT_BUFFER: usize = 256;
const PROMPT_FILE: &str = "claude_prompt.txt";
const MCP_SERVER_NAME: &str = "sandbox-mcp-gateway";
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_PREVIEW_CHARS: usize = 500;
const STDOUT_HEAD_LINES: usize = 10;
const AGENT_ARGS: [&str; 5] = [
    "--dangerously-skip-permissions",
    "--output-format",
    "stream-json",
    "--include-partial-messages",
    "--verbose",
];
const REPO_FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\'', '"', '!', '*', '?', '[',
    ']', '#', '~',
];

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Absent for a new session.
    pub session_id: Option<String>,
    pub prompt: String,
    pub repo: Option<String>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }
        if let Some(session_id) = &self.session_id {
            if session_id.trim().is_empty() {
                return Err(RelayError::InvalidRequest {
                    message: "session id must not be empty".to_string(),
                });
            }
        }
        if let Some(repo) = &self.repo {
            validate_repo(repo)?;
        }
        Ok(())
    }
}

fn validate_repo(repo: &str) -> Result<(), RelayError> {
    let invalid = repo.is_empty()
        || repo.starts_with('-')
        || repo
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || REPO_FORBIDDEN_CHARS.contains(&c));
    if invalid {
        return Err(RelayError::InvalidRequest {
            message: format!("invalid repository reference: {repo:?}"),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    AcquiringSandbox,
    SettingUpEnvironment,
    ConfiguringSubsystem,
    Executing,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AcquiringSandbox => "acquiring_sandbox",
            Self::SettingUpEnvironment => "setting_up_environment",
            Self::ConfiguringSubsystem => "configuring_subsystem",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

pub struct Orchestrator {
    config: Arc<RelayConfig>,
    gateway: Arc<dyn SandboxGateway>,
    registry: Arc<SessionRegistry>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RelayConfig>,
        gateway: Arc<dyn SandboxGateway>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            gateway,
            registry,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Spawns the run and hands back its event stream. The stream always
    /// ends with a `done` event.
    pub fn start(self: &Arc<Self>, request: RunRequest) -> mpsc::Receiver<EventEnvelope> {
        let (sink, receiver) = EventSink::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(request, sink).await;
        });
        receiver
    }

    pub async fn run(&self, request: RunRequest, sink: EventSink) {
        tracing::info!(
            session_id = request.session_id.as_deref().unwrap_or("new"),
            prompt = %preview(&request.prompt, 100),
            "chat request received"
        );

        let mut run = Run {
            orchestrator: self,
            sink: &sink,
            state: RunState::Initializing,
        };
        if let Err(err) = run.execute(&request).await {
            tracing::error!(state = run.state.as_str(), error = %err, "run failed");
            run.advance(RunState::Failed);
            if !err.is_reported() {
                sink.emit(EventEnvelope::error(err.to_string())).await;
            }
        }

        tracing::info!(state = run.state.as_str(), "stream ending");
        sink.emit(EventEnvelope::done()).await;
    }
}

/// Facts about a freshly provisioned sandbox that end up in `complete`.
#[derive(Debug, Default)]
struct Provisioned {
    mcp: Option<(Vec<String>, String)>,
    router: Option<RouterStatus>,
}

struct Run<'a> {
    orchestrator: &'a Orchestrator,
    sink: &'a EventSink,
    state: RunState,
}

impl Run<'_> {
    fn config(&self) -> &RelayConfig {
        &self.orchestrator.config
    }

    fn advance(&mut self, next: RunState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "run state");
        self.state = next;
    }

    async fn emit(&self, envelope: EventEnvelope) {
        self.sink.emit(envelope).await;
    }

    async fn execute(&mut self, request: &RunRequest) -> Result<(), RelayError> {
        self.emit(EventEnvelope::status("initializing")).await;
        request.validate()?;

        self.advance(RunState::AcquiringSandbox);
        let (sandbox, provisioned) = match &request.session_id {
            None => {
                let sandbox = self.create_sandbox().await?;
                let provisioned = self.provision(sandbox.as_ref(), request).await?;
                (sandbox, Some(provisioned))
            }
            Some(session_id) => (self.reconnect(session_id).await?, None),
        };

        let exposed_urls = probe_ports(sandbox.as_ref(), &self.config().probe_ports);
        if !exposed_urls.is_empty() {
            tracing::info!(ports = ?exposed_urls.keys().collect::<Vec<_>>(), "exposed ports found");
            self.emit(EventEnvelope::ports(&exposed_urls)).await;
        }

        self.advance(RunState::Executing);
        let (result, transcript) = self.execute_agent(sandbox.as_ref(), request).await?;

        let session_id = transcript.session_id();
        if request.session_id.is_none() {
            if let Some(session_id) = &session_id {
                if let RecordOutcome::AlreadyExists { sandbox_id } =
                    self.orchestrator.registry.record(session_id, sandbox.id()).await
                {
                    tracing::warn!(session_id = %session_id, sandbox_id = %sandbox_id, "session id reused by agent");
                }
            }
        }

        let mut complete = EventEnvelope::complete()
            .with("exit_code", result.exit_code)
            .with("session_id", session_id)
            .with("sandbox_id", sandbox.id())
            .with("exposed_urls", exposed_urls_value(&exposed_urls));
        if !result.success() {
            complete = complete
                .with("stdout_head", stdout_head(&transcript))
                .with("stderr", transcript.stderr_lines().join("\n"));
        }
        if let Some(provisioned) = provisioned {
            if let Some((enabled, url)) = provisioned.mcp {
                complete = complete
                    .with("mcp_enabled", enabled)
                    .with("mcp_gateway_url", url);
            }
            if let Some(router) = provisioned.router {
                complete = complete
                    .with("using_groq", router.started)
                    .with("router_status", router.to_value());
            }
        }
        tracing::info!(exit_code = result.exit_code, sandbox_id = %sandbox.id(), "run complete");
        self.emit(complete).await;

        self.advance(RunState::Completed);
        Ok(())
    }

    async fn create_sandbox(&self) -> Result<Arc<dyn SandboxHandle>, RelayError> {
        let config = self.config();
        let capabilities = config.capabilities();
        let template = if capabilities.is_empty() {
            config.sandbox_template.clone()
        } else {
            config.capability_template.clone()
        };

        tracing::info!(template = %template, "creating sandbox");
        self.emit(EventEnvelope::status("creating_sandbox")).await;
        let sandbox = self
            .orchestrator
            .gateway
            .create(CreateSandbox {
                template,
                timeout: config.sandbox_timeout,
                capabilities,
                envs: config.sandbox_envs(),
            })
            .await
            .map_err(|err| RelayError::SandboxCreateFailed {
                message: err.to_string(),
            })?;

        tracing::info!(sandbox_id = %sandbox.id(), "sandbox created");
        self.emit(EventEnvelope::status("sandbox_ready").with("sandbox_id", sandbox.id()))
            .await;
        Ok(sandbox)
    }

    async fn reconnect(&self, session_id: &str) -> Result<Arc<dyn SandboxHandle>, RelayError> {
        let sandbox_id = self
            .orchestrator
            .registry
            .lookup(session_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        tracing::info!(session_id = %session_id, sandbox_id = %sandbox_id, "reconnecting to sandbox");
        let sandbox = self
            .orchestrator
            .gateway
            .connect(&sandbox_id)
            .await
            .map_err(|err| RelayError::SandboxConnectFailed {
                sandbox_id: sandbox_id.clone(),
                message: err.to_string(),
            })?;

        self.emit(
            EventEnvelope::status("connected_to_session")
                .with("session_id", session_id)
                .with("sandbox_id", sandbox.id()),
        )
        .await;
        Ok(sandbox)
    }

    async fn provision(
        &mut self,
        sandbox: &dyn SandboxHandle,
        request: &RunRequest,
    ) -> Result<Provisioned, RelayError> {
        self.advance(RunState::SettingUpEnvironment);
        let template_path = template_path(sandbox, self.config());

        self.emit(EventEnvelope::status("setting_up_template")).await;
        let config = self.config();
        self.setup_step(
            sandbox,
            "template clone",
            &format!(
                "git clone {} {}",
                shell_quote(&config.template_repo),
                shell_quote(&template_path)
            ),
        )
        .await?;
        self.setup_step(
            sandbox,
            "template cleanup",
            &format!("rm -rf {}", shell_quote(&format!("{template_path}/.git"))),
        )
        .await?;
        self.setup_step(
            sandbox,
            "dependency install",
            &format!("cd {} && {}", shell_quote(&template_path), config.install_command),
        )
        .await?;
        tracing::info!(path = %template_path, "template ready");
        self.emit(EventEnvelope::status("template_ready").with("path", template_path.as_str()))
            .await;

        if let Some(repo) = &request.repo {
            tracing::info!(repo = %repo, "cloning additional repository");
            self.emit(EventEnvelope::status("cloning_additional_repo").with("repo", repo.as_str()))
                .await;
            self.setup_step(
                sandbox,
                "repository clone",
                &format!(
                    "cd {} && git clone {}",
                    shell_quote(sandbox.home_dir()),
                    shell_quote(repo)
                ),
            )
            .await?;
        }

        let mut provisioned = Provisioned {
            mcp: self.configure_capabilities(sandbox).await,
            router: None,
        };

        if self.config().router.enabled {
            self.advance(RunState::ConfiguringSubsystem);
            let settings = &self.orchestrator.config.router;
            let (queue, mut mux) = multiplexer::channel::<EventEnvelope>(settings.poll_interval);
            let setup = RouterSetup::new(sandbox, settings, queue);
            let status = mux.drive(setup.run(), self.sink, Some).await?;
            self.emit(EventEnvelope::router_ready(status.to_value())).await;
            provisioned.router = Some(status);
        }

        Ok(provisioned)
    }

    /// Runs one setup command; a nonzero exit aborts the request.
    async fn setup_step(
        &self,
        sandbox: &dyn SandboxHandle,
        step: &str,
        command: &str,
    ) -> Result<CommandResult, RelayError> {
        tracing::info!(step, "running setup step");
        let result = sandbox
            .run(command, RunOptions::new(self.config().setup_timeout))
            .await?;
        if !result.success() {
            let output = result.output_text().trim();
            tracing::error!(step, exit_code = result.exit_code, output = %preview(output, LOG_PREVIEW_CHARS), "setup step failed");
            return Err(RelayError::SetupFailed {
                step: step.to_string(),
                exit_code: result.exit_code,
                output: (!output.is_empty()).then(|| preview(output, LOG_PREVIEW_CHARS)),
            });
        }
        Ok(result)
    }

    async fn configure_capabilities(&self, sandbox: &dyn SandboxHandle) -> Option<(Vec<String>, String)> {
        let capabilities = self.config().capabilities();
        if capabilities.is_empty() {
            tracing::debug!("no capability servers configured");
            return None;
        }

        self.emit(EventEnvelope::status("configuring_mcp")).await;
        let gateway = match sandbox.capability_gateway().await {
            Ok(Some(gateway)) => gateway,
            Ok(None) => {
                self.emit(EventEnvelope::warning("Sandbox does not expose an MCP gateway"))
                    .await;
                return None;
            }
            Err(err) => {
                self.emit(EventEnvelope::warning(format!("MCP gateway lookup failed: {err}")))
                    .await;
                return None;
            }
        };

        let command = format!(
            "claude mcp add --transport http {MCP_SERVER_NAME} {} --header {}",
            shell_quote(&gateway.url),
            shell_quote(&format!("Authorization: Bearer {}", gateway.token))
        );
        let registered = sandbox
            .run(&command, RunOptions::new(self.config().setup_timeout))
            .await;
        match registered {
            Ok(result) if result.success() => {}
            Ok(result) => {
                tracing::warn!(exit_code = result.exit_code, "mcp registration failed");
                self.emit(EventEnvelope::warning(format!(
                    "MCP registration failed with exit code {}",
                    result.exit_code
                )))
                .await;
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "mcp registration failed");
                self.emit(EventEnvelope::warning(format!("MCP registration failed: {err}")))
                    .await;
                return None;
            }
        }

        let enabled: Vec<String> = capabilities.keys().cloned().collect();
        tracing::info!(servers = ?enabled, url = %gateway.url, "mcp configured");
        self.emit(EventEnvelope::mcp_configured(&enabled, gateway.url.as_str()))
            .await;
        Some((enabled, gateway.url))
    }

    async fn execute_agent(
        &self,
        sandbox: &dyn SandboxHandle,
        request: &RunRequest,
    ) -> Result<(CommandResult, TurnTranscript), RelayError> {
        let config = self.config();
        self.emit(EventEnvelope::status("executing")).await;

        let template_path = template_path(sandbox, config);
        let prompt_path = format!("{}/{PROMPT_FILE}", sandbox.home_dir());
        let combined = format!(
            "{}\n\n---\n\nUser Request:\n{}",
            config.instructions_for(&template_path),
            request.prompt
        );
        sandbox.write_file(&prompt_path, &combined).await?;
        tracing::debug!(path = %prompt_path, chars = combined.chars().count(), "prompt written");

        self.preflight(sandbox, &prompt_path).await;

        let mut command = format!(
            "cd {} && cat {} | {} {}",
            shell_quote(&template_path),
            shell_quote(&prompt_path),
            config.agent_command(),
            AGENT_ARGS.join(" ")
        );
        if let Some(session_id) = &request.session_id {
            command.push_str(" --resume ");
            command.push_str(&shell_quote(session_id));
        }
        tracing::info!(command = %preview(&command, 200), "executing agent");

        let (output, mut mux) = multiplexer::channel::<OutputLine>(config.execution_poll);
        let options = RunOptions::new(config.execution_timeout).streaming(output);
        let mut transcript = TurnTranscript::new();
        let result = mux
            .drive(sandbox.run(&command, options), self.sink, |line| match line {
                OutputLine::Stdout(line) => transcript.push_stdout(line),
                OutputLine::Stderr(line) => Some(transcript.push_stderr(line)),
            })
            .await?;

        tracing::info!(exit_code = result.exit_code, "agent command finished");
        if !result.success() {
            let head = stdout_head(&transcript);
            let stderr = transcript.stderr_lines().join("\n");
            tracing::warn!(
                exit_code = result.exit_code,
                stdout_lines = transcript.stdout_lines().len(),
                stderr_lines = transcript.stderr_lines().len(),
                stdout = %preview(&head, LOG_PREVIEW_CHARS),
                stderr = %preview(&stderr, LOG_PREVIEW_CHARS),
                "agent command exited with nonzero status"
            );
        }

        Ok((result, transcript))
    }

    /// Diagnostics for the logs only; failures here never affect the run.
    async fn preflight(&self, sandbox: &dyn SandboxHandle, prompt_path: &str) {
        let config = self.config();
        let agent_binary = config
            .agent_command()
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let mut checks = vec![
            ("prompt_file", format!("wc -c < {}", shell_quote(prompt_path))),
            ("agent_binary", format!("command -v {}", shell_quote(agent_binary))),
        ];
        if config.router.enabled {
            checks.push((
                "router_health",
                format!(
                    "curl -s -o /dev/null -w '%{{http_code}}' {}",
                    shell_quote(&config.router.url())
                ),
            ));
        }

        for (check, command) in checks {
            match sandbox.run(&command, RunOptions::new(PREFLIGHT_TIMEOUT)).await {
                Ok(result) => tracing::debug!(
                    check,
                    exit_code = result.exit_code,
                    output = %preview(result.output_text().trim(), 200),
                    "preflight"
                ),
                Err(err) => tracing::debug!(check, error = %err, "preflight check failed"),
            }
        }
    }
}

fn stdout_head(transcript: &TurnTranscript) -> String {
    transcript
        .stdout_lines()
        .iter()
        .take(STDOUT_HEAD_LINES)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

fn template_path(sandbox: &dyn SandboxHandle, config: &RelayConfig) -> String {
    format!("{}/{}", sandbox.home_dir(), config.template_dir)
}

/// Best-effort: ports the gateway does not expose are simply left out.
pub fn probe_ports(sandbox: &dyn SandboxHandle, ports: &[u16]) -> BTreeMap<u16, String> {
    ports
        .iter()
        .filter_map(|&port| sandbox.exposed_url(port).map(|url| (port, url)))
        .collect()
}
