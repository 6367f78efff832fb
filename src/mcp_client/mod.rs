//! MCP client: JSON-RPC over stdio for a fleet of tool servers.
//!
//! This module handles:
//! - Loading the server registry and expanding its placeholders
//! - Spawning and stopping MCP server child processes on demand
//! - Line-delimited JSON-RPC 2.0 exchanges over process stdio
//! - Tool discovery and a per-server tool cache
//! - Tool calls with a fallback to the legacy `call_tool` convention
//!
//! [`McpClient`] is the async entry point; [`BlockingMcpClient`] wraps it for
//! callers without a runtime.

pub mod blocking;
pub mod client;
pub mod config;
pub mod errors;
pub mod process;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use blocking::BlockingMcpClient;
pub use client::{ClientOptions, McpClient, DEFAULT_CALL_TIMEOUT, PROTOCOL_VERSION};
pub use errors::McpError;
pub use process::{ProcessState, ServerProcess};
pub use registry::ToolCache;
pub use types::{CallResult, ServerConfig, ToolDescriptor};
