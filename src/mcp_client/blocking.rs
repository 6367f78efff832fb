//! Blocking wrapper around [`McpClient`].
//!
//! For callers without an async runtime: the wrapper owns a small
//! multi-threaded runtime so the output readers keep draining between calls,
//! and every operation blocks the calling thread until it completes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use super::client::{ClientOptions, McpClient};
use super::errors::McpError;
use super::types::{CallResult, ServerConfig, ToolDescriptor};

/// Worker threads backing the blocking client.
const RUNTIME_WORKERS: usize = 2;

/// Synchronous [`McpClient`]. Must not be used from inside an async runtime.
pub struct BlockingMcpClient {
    // Declared before `runtime` so servers are stopped while it is still alive.
    inner: McpClient,
    runtime: tokio::runtime::Runtime,
}

impl BlockingMcpClient {
    pub fn new(
        configs: HashMap<String, ServerConfig>,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        Ok(Self {
            inner: McpClient::new(configs, options),
            runtime: build_runtime()?,
        })
    }

    /// Load the registry at `path` and create a client over it.
    pub fn from_config_file(path: &Path, options: ClientOptions) -> Result<Self, McpError> {
        Ok(Self {
            inner: McpClient::from_config_file(path, options)?,
            runtime: build_runtime()?,
        })
    }

    /// The wrapped async client.
    pub fn client(&self) -> &McpClient {
        &self.inner
    }

    /// See [`McpClient::call`].
    pub fn call(
        &self,
        server: &str,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallResult, McpError> {
        self.runtime
            .block_on(self.inner.call(server, tool, params, timeout))
    }

    pub fn ensure_started(&self, server: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.ensure_started(server))
    }

    pub fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.runtime.block_on(self.inner.list_tools(server))
    }

    pub fn refresh_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.runtime.block_on(self.inner.refresh_tools(server))
    }

    pub fn stop_server(&self, server: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.stop_server(server))
    }

    pub fn configured_servers(&self) -> Vec<String> {
        self.inner.configured_servers()
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.runtime.block_on(self.inner.running_servers())
    }

    /// Stop every server. The client stays usable; servers restart lazily.
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

impl Drop for BlockingMcpClient {
    fn drop(&mut self) {
        // block_on panics inside a runtime; there, kill-on-drop of each child takes over.
        if tokio::runtime::Handle::try_current().is_err() {
            self.close();
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, McpError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RUNTIME_WORKERS)
        .thread_name("toolfleet-io")
        .enable_all()
        .build()
        .map_err(|e| McpError::RuntimeError {
            reason: format!("failed to build runtime: {e}"),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
