pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use mcp_client::{
    BlockingMcpClient, CallResult, ClientOptions, McpClient, McpError, ServerConfig,
    ToolDescriptor,
};

/// Name of the active log file inside the log directory.
const LOG_FILE_NAME: &str = "mcp.log";

/// Rotated log files kept next to the active one.
const LOG_KEEP: u32 = 3;

/// Return the platform-standard log directory for toolfleet.
///
/// - macOS: `~/Library/Application Support/toolfleet/logs`
/// - Windows: `{FOLDERID_RoamingAppData}\toolfleet\logs`
/// - Linux: `$XDG_DATA_HOME/toolfleet/logs` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolfleet/logs` only if none of the above can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolfleet").join("logs");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolfleet")
        .join("logs")
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// On each call:
/// 1. Rotates existing logs (mcp.log → mcp.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh mcp.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log file path.
///
/// Returns the path of the active log file. A subscriber that is already
/// installed is left in place.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_KEEP);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolfleet=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== toolfleet starting ==="
        );
    }

    Ok(log_path)
}

/// Rotate log files: `mcp.log` → `mcp.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));

    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk before a crash can lose it.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
