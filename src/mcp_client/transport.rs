//! JSON-RPC over stdio: request/response correlation.
//!
//! One request line is written to the server's stdin, then stdout lines are
//! consumed until one is recognized as the response or the deadline passes.
//! Non-JSON lines (banners, log output) are skipped.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::errors::McpError;
use super::process::ServerProcess;
use super::types::{CallResult, JsonRpcRequest, ToolDescriptor};

// ─── Exchange ────────────────────────────────────────────────────────────────

/// Send `request` and wait up to `timeout` for its response.
///
/// The caller must ensure no other request is in flight on the same server:
/// correlation accepts any object carrying `result` or `error`, because some
/// servers do not echo the request id.
pub async fn exchange<P: Serialize>(
    process: &ServerProcess,
    request: &JsonRpcRequest<P>,
    timeout: Duration,
) -> Result<Value, McpError> {
    exchange_until(process, request, Instant::now() + timeout, timeout).await
}

/// Like [`exchange`], but waits until `deadline`, a point shared with other
/// exchanges of the same operation. `budget` is the operation's whole timeout,
/// reported on expiry. Nothing is sent once the deadline has passed.
pub async fn exchange_until<P: Serialize>(
    process: &ServerProcess,
    request: &JsonRpcRequest<P>,
    deadline: Instant,
    budget: Duration,
) -> Result<Value, McpError> {
    let server = process.name();
    let timed_out = || McpError::Timeout {
        server: server.to_string(),
        method: request.method.clone(),
        timeout_ms: budget.as_millis() as u64,
    };
    if Instant::now() >= deadline {
        return Err(timed_out());
    }

    let line = serde_json::to_string(request).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize request: {e}"),
    })?;

    // Anything still queued belongs to an earlier, abandoned request.
    let stale = process.discard_pending().await;
    if stale > 0 {
        tracing::debug!(server, stale, "discarded stale output before request");
    }

    process.send_line(&line).await?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }

        let Some(line) = process.read_line(remaining).await? else {
            continue;
        };

        match match_response(&line, &request.id) {
            Some(response) => return Ok(response),
            None => tracing::trace!(server, line = %line.trim(), "skipping non-response output"),
        }
    }
}

/// Parse `line` and return it if it is the response to request `id`.
///
/// Accepted: a JSON object carrying the exact id, or any JSON object with a
/// top-level `result` or `error` key.
pub fn match_response(line: &str, id: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let object = value.as_object()?;

    let id_matches = object.get("id").and_then(Value::as_str) == Some(id);
    if id_matches || object.contains_key("result") || object.contains_key("error") {
        Some(value)
    } else {
        None
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Normalize a tool call response into a [`CallResult`].
///
/// `result` wins; otherwise a non-empty `error` value is passed through
/// verbatim, falling back to the whole response when it carries neither.
pub fn to_call_result(response: Value) -> CallResult {
    if let Some(result) = response.get("result") {
        return CallResult::success(result.clone());
    }
    match response.get("error") {
        Some(error) if !is_empty_value(error) => CallResult::failure(error.clone()),
        _ => CallResult::failure(response),
    }
}

/// Whether `value` carries nothing: null, `false`, zero, or an empty
/// string, array or object. Servers use all of these for "no error".
pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Extract the tool list from a `tools/list` response.
///
/// Servers disagree on the shape: `result.tools`, `result.data`, or a bare
/// array in `result` are all accepted. An empty `tools` defers to `data`.
/// Entries without a usable `name` are skipped.
pub fn parse_tool_list(server: &str, response: &Value) -> Result<Vec<ToolDescriptor>, McpError> {
    let unexpected = || McpError::UnexpectedResponse {
        server: server.to_string(),
        method: "tools/list".into(),
        response: response.clone(),
    };

    let entries: &[Value] = match response.get("result") {
        Some(Value::Object(result)) => {
            let listed = [result.get("tools"), result.get("data")]
                .into_iter()
                .flatten()
                .find(|value| !is_empty_value(value));
            match listed {
                Some(Value::Array(entries)) => entries.as_slice(),
                None => &[],
                Some(_) => return Err(unexpected()),
            }
        }
        Some(Value::Array(entries)) => entries.as_slice(),
        _ => return Err(unexpected()),
    };

    let tools: Vec<ToolDescriptor> = entries
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(tool) => Some(tool),
            Err(e) => {
                tracing::debug!(server, error = %e, "skipping malformed tool entry");
                None
            }
        })
        .collect();

    Ok(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
