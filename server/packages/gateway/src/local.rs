//! Sandboxes backed by plain directories on the local machine.
//!
//! Each sandbox is a directory under the gateway root. Commands run through
//! `sh -c` with `HOME` pointing at that directory. There is no isolation
//! beyond the working directory and environment, so this gateway is meant for
//! development and self-hosted setups.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use crate::{
    CapabilityGateway, CommandResult, CreateSandbox, GatewayError, GatewayFuture, OutputLine,
    RunOptions, SandboxGateway, SandboxHandle,
};

#[derive(Debug)]
pub struct LocalGateway {
    root: PathBuf,
    sandboxes: Mutex<HashMap<String, Arc<LocalSandbox>>>,
    counter: AtomicU64,
}

#[derive(Debug)]
struct LocalSandbox {
    id: String,
    home: PathBuf,
    home_display: String,
    envs: BTreeMap<String, String>,
    expires_at: Instant,
}

impl LocalGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sandboxes: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("local-{millis:x}-{count}")
    }

    async fn create_sandbox(&self, request: CreateSandbox) -> Result<Arc<LocalSandbox>, GatewayError> {
        self.sweep_expired().await;

        let id = self.next_id();
        let home = self.root.join(&id);
        tokio::fs::create_dir_all(&home).await?;
        let home = tokio::fs::canonicalize(&home).await?;

        if !request.capabilities.is_empty() {
            tracing::warn!(
                sandbox_id = %id,
                capabilities = ?request.capabilities.keys().collect::<Vec<_>>(),
                "local gateway has no capability gateway; capabilities ignored"
            );
        }

        let sandbox = Arc::new(LocalSandbox {
            home_display: home.to_string_lossy().into_owned(),
            id: id.clone(),
            home,
            envs: request.envs,
            expires_at: Instant::now() + request.timeout,
        });
        self.sandboxes.lock().await.insert(id.clone(), sandbox.clone());

        tracing::info!(
            sandbox_id = %id,
            template = %request.template,
            home = %sandbox.home_display,
            "local sandbox created"
        );
        Ok(sandbox)
    }

    /// Drops expired sandboxes from the map and deletes their directories.
    async fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<LocalSandbox>> = {
            let mut sandboxes = self.sandboxes.lock().await;
            let ids: Vec<String> = sandboxes
                .iter()
                .filter(|(_, sandbox)| now >= sandbox.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sandboxes.remove(id)).collect()
        };

        for sandbox in expired {
            match tokio::fs::remove_dir_all(&sandbox.home).await {
                Ok(()) => tracing::info!(sandbox_id = %sandbox.id, "expired local sandbox removed"),
                Err(err) => tracing::warn!(
                    sandbox_id = %sandbox.id,
                    error = %err,
                    "failed to remove expired local sandbox"
                ),
            }
        }
    }

    async fn connect_sandbox(&self, sandbox_id: &str) -> Result<Arc<LocalSandbox>, GatewayError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            })?;

        if Instant::now() >= sandbox.expires_at {
            sandboxes.remove(sandbox_id);
            tracing::info!(sandbox_id = %sandbox_id, "local sandbox expired");
            return Err(GatewayError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }

        Ok(sandbox)
    }
}

impl SandboxGateway for LocalGateway {
    fn create(&self, request: CreateSandbox) -> GatewayFuture<'_, Arc<dyn SandboxHandle>> {
        async move {
            let sandbox = self.create_sandbox(request).await?;
            Ok(sandbox as Arc<dyn SandboxHandle>)
        }
        .boxed()
    }

    fn connect<'a>(&'a self, sandbox_id: &'a str) -> GatewayFuture<'a, Arc<dyn SandboxHandle>> {
        async move {
            let sandbox = self.connect_sandbox(sandbox_id).await?;
            Ok(sandbox as Arc<dyn SandboxHandle>)
        }
        .boxed()
    }
}

impl LocalSandbox {
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home.join(path)
        }
    }

    async fn run_command(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, GatewayError> {
        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .current_dir(&self.home)
            .env("HOME", &self.home)
            .envs(&self.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches pipeline children.
        #[cfg(unix)]
        shell.process_group(0);

        let mut child = shell.spawn().map_err(|error| GatewayError::Spawn {
            command: command.to_string(),
            error,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or(GatewayError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(GatewayError::MissingPipe("stderr"))?;

        let collect = async {
            let (stdout, stderr) = tokio::join!(
                pump_lines(stdout, options.output.clone(), OutputLine::Stdout),
                pump_lines(stderr, options.output.clone(), OutputLine::Stderr),
            );
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        match tokio::time::timeout(options.timeout, collect).await {
            Ok(Ok((status, stdout, stderr))) => {
                let exit_code = status.code().unwrap_or(-1);
                tracing::debug!(sandbox_id = %self.id, exit_code, "local command finished");
                Ok(CommandResult {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            Ok(Err(err)) => Err(GatewayError::Io(err)),
            Err(_) => {
                kill_process_group(pid);
                tracing::warn!(
                    sandbox_id = %self.id,
                    timeout_ms = options.timeout.as_millis() as u64,
                    "local command timed out"
                );
                Err(GatewayError::Timeout {
                    command: command.to_string(),
                    timeout_ms: options.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), GatewayError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        tracing::debug!(sandbox_id = %self.id, path = %target.display(), bytes = content.len(), "file written");
        Ok(())
    }
}

impl SandboxHandle for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn home_dir(&self) -> &str {
        &self.home_display
    }

    fn run<'a>(&'a self, command: &'a str, options: RunOptions) -> GatewayFuture<'a, CommandResult> {
        self.run_command(command, options).boxed()
    }

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> GatewayFuture<'a, ()> {
        self.write(path, content).boxed()
    }

    fn exposed_url(&self, port: u16) -> Option<String> {
        Some(format!("http://localhost:{port}"))
    }

    fn capability_gateway(&self) -> GatewayFuture<'_, Option<CapabilityGateway>> {
        async { Ok(None) }.boxed()
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "process group already gone"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Reads `reader` line by line until EOF. Invalid UTF-8 is replaced with
/// U+FFFD and reading continues.
async fn pump_lines<R>(
    reader: R,
    sink: Option<mpsc::UnboundedSender<OutputLine>>,
    wrap: fn(String) -> OutputLine,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut captured = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                captured.push_str(&line);
                captured.push('\n');
                if let Some(sink) = &sink {
                    let _ = sink.send(wrap(line));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed reading command output");
                break;
            }
        }
    }
    captured
}
