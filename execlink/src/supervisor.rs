//! Agent process supervision.
//!
//! Establishing a session:
//! 1. Bind a listener on the configured host (loopback if that fails)
//! 2. Launch the agent with the listener's address
//! 3. Wait for the first of: agent connects, agent exits, deadline
//!
//! On failure the child is killed and reaped and the listener closed before
//! the error is returned; the child's captured stdout/stderr go into the
//! error. On success the capture files are deleted and the child is handed
//! to an [`AgentProcess`] watcher.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{AGENT_ADDR_ENV, AgentAddress, HostListener};
use crate::config::{AgentConfig, LaunchMode, SpecError};

/// Captured agent output longer than this is cut from the front.
const MAX_DIAGNOSTICS: usize = 16 * 1024;

/// Everything a launcher needs to start one agent.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Where the agent must connect.
    pub address: AgentAddress,
    pub mode: LaunchMode,
    /// Files the agent's stdout/stderr should be redirected to.
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different agent start strategies.
pub trait AgentLauncher: Send + Sync {
    /// Start an agent that will connect to `request.address`.
    ///
    /// Returns `None` when no child process is owned by the caller (the
    /// agent runs elsewhere and connects on its own).
    fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>, SpawnError>;
}

/// Starts the agent as a child OS process.
///
/// Launch mode hands the address over in `EXECLINK_AGENT_ADDR`; listen mode
/// appends `--connect <address>` to the arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl AgentLauncher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>, SpawnError> {
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .open(&request.stdout)?;
        let stderr = std::fs::OpenOptions::new()
            .append(true)
            .open(&request.stderr)?;

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        match request.mode {
            LaunchMode::Launch => {
                command.env(AGENT_ADDR_ENV, request.address.to_string());
            }
            LaunchMode::Listen => {
                command.arg("--connect").arg(request.address.to_string());
            }
        }
        Ok(Some(command.spawn()?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot listen for agent connection: {0}")]
    Listen(#[source] io::Error),
    #[error("cannot capture agent output: {0}")]
    Prepare(#[source] io::Error),
    #[error("failed to launch agent: {0}")]
    Spawn(#[from] SpawnError),
    #[error("agent did not connect within {}ms{}", .timeout.as_millis(), diagnostics_suffix(.diagnostics))]
    Timeout {
        timeout: Duration,
        diagnostics: String,
    },
    #[error("agent exited before connecting ({status}){}", diagnostics_suffix(.diagnostics))]
    Exited { status: String, diagnostics: String },
    #[error("failed to accept agent connection: {0}")]
    Accept(#[source] io::Error),
    #[error("all {attempts} execution providers failed:\n{summary}\nlast failure: {last}")]
    Exhausted {
        attempts: usize,
        summary: String,
        last: Box<SupervisorError>,
    },
    #[error(transparent)]
    Spec(#[from] SpecError),
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\n{diagnostics}")
    }
}

/// Temp files receiving the agent's stdout/stderr. Deleted on drop.
struct Diagnostics {
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

impl Diagnostics {
    fn create() -> io::Result<Self> {
        Ok(Self {
            stdout: tempfile::Builder::new()
                .prefix("execlink-agent-out")
                .tempfile()?,
            stderr: tempfile::Builder::new()
                .prefix("execlink-agent-err")
                .tempfile()?,
        })
    }

    async fn collect(self) -> String {
        let mut report = String::new();
        for (label, path) in [("stdout", self.stdout.path()), ("stderr", self.stderr.path())] {
            let text = read_tail(path).await;
            let text = text.trim_end();
            if !text.is_empty() {
                if !report.is_empty() {
                    report.push('\n');
                }
                report.push_str(&format!("agent {label}:\n{text}"));
            }
        }
        report
    }
}

async fn read_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(MAX_DIAGNOSTICS);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) => format!("<unreadable: {e}>"),
    }
}

enum Outcome {
    Connected(io::Result<TcpStream>),
    Exited(io::Result<ExitStatus>),
    TimedOut,
}

async fn wait_for_exit(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Start an agent per `config` and wait for it to connect.
pub async fn establish(
    config: &AgentConfig,
    launcher: &dyn AgentLauncher,
) -> Result<(TcpStream, AgentProcess), SupervisorError> {
    let listener = HostListener::bind_with_fallback(&config.host)
        .await
        .map_err(SupervisorError::Listen)?;
    let diagnostics = Diagnostics::create().map_err(SupervisorError::Prepare)?;
    let request = LaunchRequest {
        program: config.remote_agent.clone(),
        args: config.agent_args.clone(),
        address: listener.address().clone(),
        mode: config.mode,
        stdout: diagnostics.stdout.path().to_path_buf(),
        stderr: diagnostics.stderr.path().to_path_buf(),
    };
    let timeout = config.effective_timeout();

    tracing::info!(
        agent = %request.program,
        address = %request.address,
        mode = %request.mode,
        timeout_ms = timeout.as_millis() as u64,
        "Starting agent"
    );
    let mut child = launcher.launch(&request)?;

    let outcome = tokio::select! {
        accepted = listener.accept() => Outcome::Connected(accepted),
        status = wait_for_exit(&mut child) => Outcome::Exited(status),
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
    };

    if let Outcome::Connected(Ok(stream)) = outcome {
        drop(listener);
        let process = match child {
            Some(child) => AgentProcess::watch(child),
            None => AgentProcess::detached(),
        };
        tracing::info!(pid = ?process.id(), "Agent connected");
        return Ok((stream, process));
    }

    if let Some(child) = child.as_mut()
        && let Err(e) = child.kill().await
    {
        tracing::debug!(error = %e, "Killing agent failed");
    }
    drop(listener);
    let diagnostics = diagnostics.collect().await;

    let error = match outcome {
        Outcome::Connected(Err(e)) => SupervisorError::Accept(e),
        Outcome::Exited(status) => SupervisorError::Exited {
            status: match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("status unavailable: {e}"),
            },
            diagnostics,
        },
        Outcome::TimedOut | Outcome::Connected(Ok(_)) => SupervisorError::Timeout {
            timeout,
            diagnostics,
        },
    };
    tracing::warn!(error = %error, "Agent connection failed");
    Err(error)
}

/// Owns a connected agent's child process.
///
/// A watcher task reaps the child and publishes its exit status; it kills
/// the child on [`terminate`](Self::terminate) or when this value drops.
pub struct AgentProcess {
    id: Option<u32>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl AgentProcess {
    pub fn watch(mut child: Child) -> Self {
        let id = child.id();
        let kill = CancellationToken::new();
        let (exit_tx, exit) = watch::channel(None);

        let token = kill.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    tracing::debug!(pid = ?id, "Killing agent");
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(pid = ?id, error = %e, "Kill signal failed");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    if !status.success() && !token.is_cancelled() {
                        tracing::warn!(pid = ?id, %status, "Agent exited abnormally");
                    }
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => tracing::warn!(pid = ?id, error = %e, "Failed to wait for agent"),
            }
        });

        Self { id, kill, exit }
    }

    /// No owned process; the agent's lifetime is managed elsewhere.
    pub fn detached() -> Self {
        let (_, exit) = watch::channel(None);
        Self {
            id: None,
            kill: CancellationToken::new(),
            exit,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Kill the process and wait until it has been reaped.
    pub async fn terminate(&self) {
        self.kill.cancel();
        let mut exit = self.exit.clone();
        // Errors only when no watcher is left to report.
        let _ = exit.wait_for(Option::is_some).await;
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tokio::process::Child;

    use super::{AgentLauncher, LaunchRequest, SpawnError};
    use crate::agent::executor::testing::ScriptLoader;
    use crate::agent::{AgentOptions, run_agent};

    /// Runs the agent as a task in this process.
    pub struct InProcessLauncher;

    impl AgentLauncher for InProcessLauncher {
        fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>, SpawnError> {
            let address = request.address.clone();
            tokio::spawn(async move {
                let stream = crate::bridge::transport::connect(&address).await?;
                run_agent(
                    stream,
                    Arc::new(ScriptLoader::default()),
                    AgentOptions::default(),
                )
                .await
            });
            Ok(None)
        }
    }
}
