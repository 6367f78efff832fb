//! Server process ownership.
//!
//! A [`ServerProcess`] owns one child process: it spawns it with piped stdio,
//! drains stdout and stderr into two bounded queues from background tasks,
//! writes request lines to stdin, and terminates the child on `stop`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum number of buffered lines per stream. Newer lines are dropped when full.
const QUEUE_CAPACITY: usize = 10_000;

/// How long a server gets to exit after its stdin is closed before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Executables substituted when the configured one is not installed.
struct ExecutableFallback {
    /// Executable named in the registry.
    alias: &'static str,
    /// Executable launched instead.
    fallback: &'static str,
    /// Arguments following the alias that only make sense to the alias
    /// (e.g. the package name passed to `uvx`).
    skip_args: usize,
}

/// `uvx mcp-server-git --repository X` → `mcp-server-git --repository X`.
const EXECUTABLE_FALLBACKS: &[ExecutableFallback] = &[ExecutableFallback {
    alias: "uvx",
    fallback: "mcp-server-git",
    skip_args: 1,
}];

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`ServerProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamSource {
    Stdout,
    Stderr,
}

struct Inner {
    state: ProcessState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl Inner {
    /// Check whether the child is still alive, clearing the handle if it exited.
    fn is_alive(&mut self, server: &str) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(server, %status, "server process exited");
                self.clear();
                false
            }
            Err(e) => {
                tracing::warn!(server, error = %e, "failed to poll server process");
                self.clear();
                false
            }
        }
    }

    fn clear(&mut self) {
        self.child = None;
        self.stdin = None;
        self.state = ProcessState::Stopped;
    }
}

// ─── ServerProcess ───────────────────────────────────────────────────────────

/// One external tool server and its stdio streams.
pub struct ServerProcess {
    config: ServerConfig,
    inner: Mutex<Inner>,
    stdout: Mutex<Option<mpsc::Receiver<String>>>,
    stderr: Mutex<Option<mpsc::Receiver<String>>>,
}

impl ServerProcess {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ProcessState::NotStarted,
                child: None,
                stdin: None,
            }),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state. A child that exited on its own is reported as `Stopped`.
    pub async fn state(&self) -> ProcessState {
        let mut inner = self.inner.lock().await;
        inner.is_alive(&self.config.name);
        inner.state
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_alive(&self.config.name)
    }

    /// OS process id of the live child, if any.
    pub async fn pid(&self) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        if !inner.is_alive(&self.config.name) {
            return None;
        }
        inner.child.as_ref().and_then(Child::id)
    }

    /// Spawn the child and its reader tasks. No-op if already running.
    pub async fn start(&self) -> Result<(), McpError> {
        let name = self.config.name.as_str();
        let mut inner = self.inner.lock().await;
        if inner.is_alive(name) {
            return Ok(());
        }

        let command = resolve_command(&self.config.command, is_on_path);
        let (program, args) = command.split_first().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "empty command".into(),
        })?;

        tracing::info!(server = name, command = ?command, cwd = ?self.config.cwd, "starting server");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&self.config.env);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // The child must not outlive its handle.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{program}: {e}"),
        })?;

        let spawn_failed = |what: &str| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("failed to capture {what}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| spawn_failed("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_failed("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_failed("stderr"))?;

        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(drain_stream(name.to_string(), stdout, out_tx, StreamSource::Stdout));
        tokio::spawn(drain_stream(name.to_string(), stderr, err_tx, StreamSource::Stderr));
        *self.stdout.lock().await = Some(out_rx);
        *self.stderr.lock().await = Some(err_rx);

        tracing::info!(server = name, pid = ?child.id(), "server started");
        inner.child = Some(child);
        inner.stdin = Some(stdin);
        inner.state = ProcessState::Running;
        Ok(())
    }

    /// Write `line` plus a newline to the child's stdin and flush.
    pub async fn send_line(&self, line: &str) -> Result<(), McpError> {
        let name = self.config.name.as_str();
        let mut inner = self.inner.lock().await;
        if !inner.is_alive(name) {
            return Err(McpError::NotStarted {
                name: name.to_string(),
            });
        }
        let stdin = inner.stdin.as_mut().ok_or(McpError::NotStarted {
            name: name.to_string(),
        })?;

        let transport_error = |what: &str, e: std::io::Error| McpError::TransportError {
            server: name.to_string(),
            reason: format!("failed to {what} stdin: {e}"),
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| transport_error("write to", e))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| transport_error("write to", e))?;
        stdin.flush().await.map_err(|e| transport_error("flush", e))?;
        Ok(())
    }

    /// Pop one stdout line, waiting up to `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time, which is normal. An error
    /// means the process was never started or its stdout has closed and
    /// every buffered line has been consumed.
    pub async fn read_line(&self, timeout: Duration) -> Result<Option<String>, McpError> {
        self.read_from(&self.stdout, timeout).await
    }

    /// Pop one stderr line, waiting up to `timeout`.
    pub async fn read_stderr_line(&self, timeout: Duration) -> Result<Option<String>, McpError> {
        self.read_from(&self.stderr, timeout).await
    }

    async fn read_from(
        &self,
        queue: &Mutex<Option<mpsc::Receiver<String>>>,
        timeout: Duration,
    ) -> Result<Option<String>, McpError> {
        let mut guard = queue.lock().await;
        let rx = guard.as_mut().ok_or(McpError::NotStarted {
            name: self.config.name.clone(),
        })?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => Err(McpError::TransportError {
                server: self.config.name.clone(),
                reason: "server output closed (process may have exited)".into(),
            }),
            Err(_) => Ok(None),
        }
    }

    /// Drop every stdout line already queued. Returns how many were dropped.
    pub async fn discard_pending(&self) -> usize {
        let mut guard = self.stdout.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut dropped = 0;
        loop {
            match rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        dropped
    }

    /// Terminate the child: close stdin, wait briefly, then kill.
    ///
    /// No-op if not running. Never fails; problems are logged.
    pub async fn stop(&self) {
        let name = self.config.name.as_str();
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            return;
        };

        tracing::info!(server = name, pid = ?child.id(), "stopping server");
        // Closing stdin is the stdio transport's shutdown signal.
        drop(inner.stdin.take());

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = name, %status, "server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = name, error = %e, "failed to wait for server; killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = name, error = %e, "failed to kill server");
                }
            }
            Err(_) => {
                tracing::warn!(
                    server = name,
                    grace_ms = STOP_GRACE.as_millis() as u64,
                    "server did not exit after stdin closed; killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = name, error = %e, "failed to kill server");
                }
            }
        }

        inner.clear();
    }
}

// ─── Reader Tasks ────────────────────────────────────────────────────────────

/// Read lines from `stream` until EOF and queue them.
///
/// A full queue drops the line instead of blocking, so a chatty child never
/// stalls on a pipe nobody reads.
async fn drain_stream<R>(server: String, stream: R, tx: mpsc::Sender<String>, source: StreamSource)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut dropped: u64 = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if source == StreamSource::Stderr {
                    tracing::debug!(server = %server, "stderr: {}", line.trim_end());
                }
                match tx.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped == 1 {
                            tracing::warn!(server = %server, ?source, "output queue full; dropping lines");
                        }
                    }
                    // Nobody is listening any more; keep draining so the child never blocks.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, ?source, error = %e, "failed to read server output");
                break;
            }
        }
    }

    if dropped > 0 {
        tracing::warn!(server = %server, ?source, dropped, "lines dropped on full queue");
    }
    tracing::debug!(server = %server, ?source, "output stream closed");
}

// ─── Command Resolution ──────────────────────────────────────────────────────

/// Apply the executable fallback table to `command`.
///
/// Only the first argument is considered, and only when it is a known alias
/// that `on_path` reports missing. Everything else is returned unchanged.
fn resolve_command(command: &[String], on_path: impl Fn(&str) -> bool) -> Vec<String> {
    let Some(program) = command.first() else {
        return Vec::new();
    };

    let Some(entry) = EXECUTABLE_FALLBACKS
        .iter()
        .find(|entry| entry.alias == program.as_str())
    else {
        return command.to_vec();
    };

    if on_path(entry.alias) {
        return command.to_vec();
    }

    tracing::info!(
        alias = entry.alias,
        fallback = entry.fallback,
        "executable not found; using fallback"
    );
    std::iter::once(entry.fallback.to_string())
        .chain(command.iter().skip(1 + entry.skip_args).cloned())
        .collect()
}

/// Whether `program` resolves to an executable, either directly or via `PATH`.
fn is_on_path(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return is_executable(Path::new(program));
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths)
        .map(|dir: PathBuf| dir.join(program))
        .any(|candidate| is_executable(&candidate))
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
