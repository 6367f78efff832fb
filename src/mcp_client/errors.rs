//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while loading the registry or talking to a server.
///
/// Protocol-level errors returned by a server (`"error"` in a response) are
/// not represented here: they are passed through verbatim inside a
/// [`CallResult`](super::types::CallResult).
#[derive(Debug, Error)]
pub enum McpError {
    /// The server registry file does not exist.
    #[error("server registry not found: {path}")]
    ConfigNotFound {
        path: String,
    },

    /// The server registry could not be read or parsed.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// The requested server is not declared in the registry.
    #[error("unknown server '{name}'")]
    UnknownServer {
        name: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// A write or read was attempted on a server with no live process.
    #[error("server '{name}' is not started")]
    NotStarted {
        name: String,
    },

    /// No matching response arrived before the deadline.
    #[error("server '{server}' timed out after {timeout_ms}ms waiting for {method}")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// I/O failure, broken pipe, closed stream, or process exit.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// A response arrived but its shape was not what the exchange expects.
    #[error("unexpected response from server '{server}' to {method}: {response}")]
    UnexpectedResponse {
        server: String,
        method: String,
        response: serde_json::Value,
    },

    /// The async runtime backing the blocking client could not be created.
    #[error("runtime error: {reason}")]
    RuntimeError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error is a transport-level failure that may be worked
    /// around by retrying with the legacy call convention.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::NotStarted { .. }
        )
    }
}
