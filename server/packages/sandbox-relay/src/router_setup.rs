//! Installs, configures and starts the model router inside a sandbox.
//!
//! Progress goes onto the shared event queue as it happens; only the final
//! [`RouterStatus`] is returned.

use sandbox_relay_error::RelayError;
use sandbox_relay_event_schema::EventEnvelope;
use sandbox_relay_gateway::{CommandResult, RunOptions, SandboxHandle};
use serde::Serialize;

use crate::config::RouterSettings;
use crate::multiplexer::EventQueue;

const ERROR_PREVIEW_CHARS: usize = 200;
const LOG_PREVIEW_CHARS: usize = 500;
const UNVERIFIED_WARNING: &str = "Port check failed but continuing";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    pub installed: bool,
    pub configured: bool,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouterStatus {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub struct RouterSetup<'a> {
    sandbox: &'a dyn SandboxHandle,
    settings: &'a RouterSettings,
    queue: EventQueue,
    status: RouterStatus,
}

impl<'a> RouterSetup<'a> {
    pub fn new(sandbox: &'a dyn SandboxHandle, settings: &'a RouterSettings, queue: EventQueue) -> Self {
        Self {
            sandbox,
            settings,
            queue,
            status: RouterStatus::default(),
        }
    }

    /// Runs install, configure, start and verify in order.
    ///
    /// A failed verification still reports `started`, with a warning. Any
    /// other failed step emits an `error` event and returns
    /// [`RelayError::SubtaskFailed`] already marked as reported.
    pub async fn run(mut self) -> Result<RouterStatus, RelayError> {
        tracing::info!(sandbox_id = %self.sandbox.id(), "setting up router");
        self.push(EventEnvelope::status("installing_router"));

        match self.steps().await {
            Ok(()) => Ok(self.status),
            Err(message) => {
                tracing::error!(sandbox_id = %self.sandbox.id(), error = %message, "router setup failed");
                self.status.error = Some(message.clone());
                let message = format!("Router setup failed: {message}");
                self.push(EventEnvelope::error(message.clone()));
                Err(RelayError::SubtaskFailed {
                    message,
                    reported: true,
                })
            }
        }
    }

    async fn steps(&mut self) -> Result<(), String> {
        let method = self.install().await?;
        self.configure().await?;
        self.start(&method).await?;
        self.verify().await;
        Ok(())
    }

    async fn install(&mut self) -> Result<String, String> {
        let mut failures = Vec::new();
        for (index, strategy) in self.settings.install_strategies.iter().enumerate() {
            self.push(
                EventEnvelope::status(format!("trying_install_method_{}", index + 1))
                    .with("method", strategy.as_str()),
            );

            let failure = match self.exec(strategy, self.settings.install_timeout).await {
                Ok(result) if result.success() => {
                    tracing::info!(method = %strategy, "router installed");
                    self.status.installed = true;
                    self.status.install_method = Some(strategy.clone());
                    self.push(EventEnvelope::status("router_installed").with("method", strategy.as_str()));
                    return Ok(strategy.clone());
                }
                Ok(result) => format!("exit code {}: {}", result.exit_code, result.output_text().trim()),
                Err(err) => err,
            };
            tracing::warn!(method = %strategy, error = %failure, "router install method failed");
            failures.push(format!("{strategy}: {}", preview(&failure, ERROR_PREVIEW_CHARS)));
        }

        Err(format!(
            "Failed to install router with all methods: {}",
            failures.join(" | ")
        ))
    }

    async fn configure(&mut self) -> Result<(), String> {
        let config_dir = format!("{}/{}", self.sandbox.home_dir(), self.settings.config_dir);
        self.exec(
            &format!("mkdir -p {}", sandbox_relay_gateway::shell_quote(&config_dir)),
            self.settings.start_timeout,
        )
        .await
        .and_then(|result| check(&result, "create router config directory"))?;

        self.sandbox
            .write_file(&format!("{config_dir}/config.json"), &self.settings.render_config())
            .await
            .map_err(|err| format!("failed to write router config: {err}"))?;

        self.status.configured = true;
        self.push(EventEnvelope::status("router_configured"));
        Ok(())
    }

    async fn start(&mut self, install_method: &str) -> Result<(), String> {
        self.push(EventEnvelope::status("starting_router"));

        let primary = if install_method.contains("bun") {
            format!("bunx {} start", self.settings.package)
        } else {
            "ccr start".to_string()
        };
        let fallback = format!("npx {} start", self.settings.package);

        let mut failures = Vec::new();
        for command in [primary, fallback] {
            let background = format!("nohup {command} > {} 2>&1 &", self.settings.log_path);
            let failure = match self.exec(&background, self.settings.start_timeout).await {
                Ok(result) if result.success() => {
                    tracing::info!(command = %command, "router start issued");
                    self.status.url = Some(self.settings.url());
                    return Ok(());
                }
                Ok(result) => format!("exit code {}: {}", result.exit_code, result.output_text().trim()),
                Err(err) => err,
            };
            tracing::warn!(command = %command, error = %failure, "router start command failed");
            failures.push(format!("{command}: {}", preview(&failure, ERROR_PREVIEW_CHARS)));
        }

        Err(format!("Failed to start router: {}", failures.join(" | ")))
    }

    async fn verify(&mut self) {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        self.push(EventEnvelope::status("verifying_router"));

        let port = self.settings.port;
        let check = format!("netstat -tuln | grep :{port} || ss -tuln | grep :{port}");
        let listening = matches!(
            self.exec(&check, self.settings.verify_timeout).await,
            Ok(result) if result.success() && !result.stdout.trim().is_empty()
        );

        self.status.started = true;
        if listening {
            tracing::info!(port, "router listening");
            self.push(EventEnvelope::status("router_started").with("port", port));
        } else {
            let logs = self
                .exec(
                    &format!("cat {} 2>/dev/null", self.settings.log_path),
                    self.settings.verify_timeout,
                )
                .await
                .map(|result| result.stdout)
                .unwrap_or_default();
            tracing::warn!(port, logs = %preview(&logs, LOG_PREVIEW_CHARS), "router port not detected");
            self.push(EventEnvelope::warning(format!(
                "Router may not be running. Logs: {}",
                preview(&logs, LOG_PREVIEW_CHARS)
            )));
            self.status.warning = Some(UNVERIFIED_WARNING.to_string());
        }
    }

    async fn exec(&self, command: &str, timeout: std::time::Duration) -> Result<CommandResult, String> {
        self.sandbox
            .run(command, RunOptions::new(timeout))
            .await
            .map_err(|err| err.to_string())
    }

    fn push(&self, envelope: EventEnvelope) {
        if self.queue.send(envelope).is_err() {
            tracing::debug!("event queue closed; dropping router progress");
        }
    }
}

fn check(result: &CommandResult, what: &str) -> Result<(), String> {
    if result.success() {
        Ok(())
    } else {
        Err(format!(
            "{what} failed with exit code {}: {}",
            result.exit_code,
            preview(result.output_text().trim(), ERROR_PREVIEW_CHARS)
        ))
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
