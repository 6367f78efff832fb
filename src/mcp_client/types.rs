//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 envelopes, tool descriptors, server configuration and the
//! uniform call result.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request envelope, written as one line on the server's stdin.
///
/// `params` is generic so typed parameters serialize in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<P = serde_json::Value> {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: P,
}

impl<P: Serialize> JsonRpcRequest<P> {
    /// Create a request with a fresh unique id.
    pub fn new(method: &str, params: P) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Parameters shared by both tool call conventions.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallParams<'a> {
    pub name: &'a str,
    pub arguments: &'a serde_json::Value,
}

// ─── Protocol Types ─────────────────────────────────────────────────────────

/// How a tool is invoked on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// `tools/call`, the standard method.
    Primary,
    /// `call_tool`, spoken by older servers.
    Legacy,
}

impl CallConvention {
    /// JSON-RPC method name for this convention.
    pub fn method(self) -> &'static str {
        match self {
            CallConvention::Primary => "tools/call",
            CallConvention::Legacy => "call_tool",
        }
    }
}

/// A tool as advertised by a server's `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// A server entry from the registry, with placeholders already expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    /// Executable followed by its arguments. Never empty.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    /// Build a config from a name and argument vector.
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

// ─── Call Result ────────────────────────────────────────────────────────────

/// Uniform outcome of a tool call: `{ok, data?, error?}`.
///
/// Callers treat `ok == false` the same way regardless of which failure
/// branch produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl CallResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed call. `error` is either a message string or a server error object.
    pub fn failure(error: impl Into<serde_json::Value>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
