use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use sandbox_relay_error::RelayError;
use sandbox_relay_event_schema::EventKind;
use sandbox_relay_gateway::LocalGateway;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::build_router;
use crate::config::RelayConfig;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::registry::SessionRegistry;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;

#[derive(Parser, Debug)]
#[command(name = "sandbox-relay", bin_name = "sandbox-relay")]
#[command(about = "Runs coding agents in sandboxes and streams their progress", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
    /// Execute one request and print its events as JSON lines.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[command(flatten)]
    relay: RelayArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Instruction for the agent.
    prompt: String,

    /// Resume a session reported by an earlier run in this process.
    #[arg(long, short = 's')]
    session: Option<String>,

    /// Extra repository to clone next to the template.
    #[arg(long)]
    repo: Option<String>,

    #[command(flatten)]
    relay: RelayArgs,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Directory holding local sandboxes.
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    #[arg(long)]
    template: Option<String>,

    #[arg(long)]
    template_repo: Option<String>,

    #[arg(long)]
    agent_command: Option<String>,

    /// Run the agent directly instead of through the model router.
    #[arg(long)]
    no_router: bool,

    /// Router config.json to use instead of the embedded one.
    #[arg(long)]
    router_config: Option<PathBuf>,

    #[arg(long)]
    execution_timeout_secs: Option<u64>,

    /// Ports to probe for exposed URLs; replaces the default list.
    #[arg(long = "probe-port")]
    probe_ports: Vec<u16>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid router config {path}: {message}")]
    RouterConfig { path: PathBuf, message: String },
    #[error("server error: {0}")]
    Server(String),
    #[error("run failed: {0}")]
    RunFailed(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn run_sandbox_relay() -> Result<(), CliError> {
    let cli = SandboxRelayCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Run(args) => run_once(args),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let orchestrator = build_orchestrator(&server.relay)?;
    let router = build_router(orchestrator).layer(build_cors_layer(server)?);
    let addr = format!("{}:{}", server.host, server.port);

    runtime()?.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_once(args: &RunArgs) -> Result<(), CliError> {
    let orchestrator = build_orchestrator(&args.relay)?;
    let request = RunRequest {
        session_id: args.session.clone(),
        prompt: args.prompt.clone(),
        repo: args.repo.clone(),
    };
    request.validate()?;

    runtime()?.block_on(async move {
        let mut events = orchestrator.start(request);
        let mut failure = None;
        let stdout = std::io::stdout();
        while let Some(envelope) = events.recv().await {
            if envelope.kind == EventKind::Error {
                failure = envelope.get_str("error").map(str::to_string);
            }
            let mut out = stdout.lock();
            writeln!(out, "{}", serde_json::to_string(&envelope)?)?;
            out.flush()?;
        }
        match failure {
            Some(message) => Err(CliError::RunFailed(message)),
            None => Ok(()),
        }
    })
}

fn build_orchestrator(args: &RelayArgs) -> Result<Arc<Orchestrator>, CliError> {
    let config = relay_config(args)?;
    let root = args.sandbox_root.clone().unwrap_or_else(default_sandbox_root);
    tracing::info!(
        sandbox_root = %root.display(),
        template = %config.sandbox_template,
        router = config.router.enabled,
        router_api_key = config.router.api_key.is_some(),
        github_pat = config.github_pat.is_some(),
        "relay configured"
    );

    Ok(Arc::new(Orchestrator::new(
        Arc::new(config),
        Arc::new(LocalGateway::new(root)),
        Arc::new(SessionRegistry::new()),
    )))
}

fn relay_config(args: &RelayArgs) -> Result<RelayConfig, CliError> {
    let mut config = RelayConfig::from_env();
    if let Some(template) = &args.template {
        config.sandbox_template = template.clone();
    }
    if let Some(repo) = &args.template_repo {
        config.template_repo = repo.clone();
    }
    if let Some(command) = &args.agent_command {
        config.agent_command = Some(command.clone());
    }
    if args.no_router {
        config.router.enabled = false;
    }
    if let Some(path) = &args.router_config {
        let template = std::fs::read_to_string(path).map_err(|err| CliError::RouterConfig {
            path: path.clone(),
            message: err.to_string(),
        })?;
        serde_json::from_str::<serde_json::Value>(&template).map_err(|err| {
            CliError::RouterConfig {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;
        config.router.config_template = template;
    }
    if let Some(secs) = args.execution_timeout_secs {
        config.execution_timeout = Duration::from_secs(secs);
    }
    if !args.probe_ports.is_empty() {
        config.probe_ports = args.probe_ports.clone();
    }
    Ok(config)
}

fn default_sandbox_root() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("sandbox-relay").join("sandboxes"))
        .unwrap_or_else(|| PathBuf::from(".").join(".sandbox-relay").join("sandboxes"))
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }

    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}
