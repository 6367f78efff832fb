//! High-level MCP client for tool execution.
//!
//! Owns one [`ServerProcess`] per configured server, starts servers lazily on
//! first use, performs the `initialize` handshake and `tools/list` discovery,
//! and exposes [`McpClient::call`] with the `tools/call` → `call_tool`
//! fallback and a uniform [`CallResult`].

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::config;
use super::errors::McpError;
use super::process::ServerProcess;
use super::registry::ToolCache;
use super::transport;
use super::types::{
    CallConvention, CallResult, JsonRpcRequest, ServerConfig, ToolCallParams, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol version declared in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// How long to wait for the `initialize` response.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the `tools/list` response.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Session settings shared by every server the client manages.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub handshake_timeout: Duration,
    pub discovery_timeout: Duration,
    pub protocol_version: String,
    /// Client identity sent in `clientInfo`.
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// A server process plus the lock that keeps one request in flight at a time.
struct ManagedServer {
    process: ServerProcess,
    /// Held from sending a request until it resolves or times out.
    turn: Mutex<()>,
}

/// Client for a fleet of stdio tool servers.
pub struct McpClient {
    /// Server registry, loaded once.
    configs: HashMap<String, ServerConfig>,
    /// Servers touched so far, by name.
    servers: Mutex<HashMap<String, Arc<ManagedServer>>>,
    /// Tools discovered per server.
    tools: ToolCache,
    options: ClientOptions,
}

impl McpClient {
    /// Create a client over an already-loaded registry. No server is started.
    pub fn new(configs: HashMap<String, ServerConfig>, options: ClientOptions) -> Self {
        Self {
            configs,
            servers: Mutex::new(HashMap::new()),
            tools: ToolCache::new(),
            options,
        }
    }

    /// Load the registry at `path` and create a client over it.
    pub fn from_config_file(path: &Path, options: ClientOptions) -> Result<Self, McpError> {
        let configs = config::load(path)?;
        tracing::info!(
            path = %path.display(),
            server_count = configs.len(),
            "loaded server registry"
        );
        Ok(Self::new(configs, options))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Look up the managed server for `name`, creating it on first use.
    async fn managed(&self, name: &str) -> Result<Arc<ManagedServer>, McpError> {
        let mut servers = self.servers.lock().await;
        if let Some(server) = servers.get(name) {
            return Ok(Arc::clone(server));
        }

        let config = self.configs.get(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })?;
        let server = Arc::new(ManagedServer {
            process: ServerProcess::new(config.clone()),
            turn: Mutex::new(()),
        });
        servers.insert(name.to_string(), Arc::clone(&server));
        Ok(server)
    }

    /// Start `name` if it is not running, then handshake and discover its tools.
    ///
    /// Handshake and discovery failures are logged, not returned: some
    /// servers implement neither.
    pub async fn ensure_started(&self, name: &str) -> Result<(), McpError> {
        let server = self.managed(name).await?;
        let _turn = server.turn.lock().await;
        self.ensure_running(&server, None).await
    }

    /// Start the server if needed. Setup exchanges end no later than `deadline`.
    ///
    /// Caller must hold `server.turn`.
    async fn ensure_running(
        &self,
        server: &ManagedServer,
        deadline: Option<Instant>,
    ) -> Result<(), McpError> {
        if server.process.is_running().await {
            return Ok(());
        }
        server.process.start().await?;
        self.initialize(server, deadline).await;
        Ok(())
    }

    /// Perform the `initialize` handshake followed by tool discovery.
    ///
    /// Caller must hold `server.turn`.
    async fn initialize(&self, server: &ManagedServer, deadline: Option<Instant>) {
        let name = server.process.name();
        let request = JsonRpcRequest::new(
            "initialize",
            json!({
                "protocolVersion": self.options.protocol_version,
                "capabilities": {},
                "clientInfo": {
                    "name": self.options.client_name,
                    "version": self.options.client_version,
                },
            }),
        );

        tracing::info!(server = name, "initialize");
        let (until, wait) = cap(self.options.handshake_timeout, deadline);
        match transport::exchange_until(&server.process, &request, until, wait).await {
            Ok(response) => match response.get("error") {
                Some(error) if !transport::is_empty_value(error) => {
                    tracing::warn!(server = name, %error, "initialize rejected; continuing");
                }
                _ => {
                    tracing::info!(
                        server = name,
                        server_info = %response["result"]["serverInfo"],
                        "handshake complete"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(server = name, error = %e, "initialize failed; continuing without handshake");
            }
        }

        if let Err(e) = self.discover(server, deadline).await {
            tracing::error!(server = name, error = %e, "tools/list failed");
        }
    }

    /// Run one `tools/list` exchange and store the result in the cache.
    ///
    /// Caller must hold `server.turn`.
    async fn discover(
        &self,
        server: &ManagedServer,
        deadline: Option<Instant>,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let name = server.process.name();
        let request = JsonRpcRequest::new("tools/list", json!({}));
        let (until, wait) = cap(self.options.discovery_timeout, deadline);
        let response = transport::exchange_until(&server.process, &request, until, wait).await?;
        let tools = transport::parse_tool_list(name, &response)?;

        tracing::info!(
            server = name,
            count = tools.len(),
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "discovered tools"
        );
        self.tools.store(name, tools.clone());
        Ok(tools)
    }

    /// Stop one server. Its tool cache entry is kept; the next call respawns it.
    pub async fn stop_server(&self, name: &str) -> Result<(), McpError> {
        if !self.configs.contains_key(name) {
            return Err(McpError::UnknownServer {
                name: name.to_string(),
            });
        }
        let server = self.servers.lock().await.get(name).cloned();
        if let Some(server) = server {
            server.process.stop().await;
        }
        Ok(())
    }

    /// Stop every server and forget all cached tools.
    pub async fn close(&self) {
        let servers: Vec<Arc<ManagedServer>> = self
            .servers
            .lock()
            .await
            .drain()
            .map(|(_, server)| server)
            .collect();

        for server in &servers {
            server.process.stop().await;
        }
        self.tools.clear();

        if !servers.is_empty() {
            tracing::info!(count = servers.len(), "all servers stopped");
        }
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Tools of `server`, starting it and refreshing discovery if the cache is empty.
    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let server = self.managed(server_name).await?;
        let _turn = server.turn.lock().await;
        self.ensure_running(&server, None).await?;

        if self.tools.is_empty(server_name) {
            if let Err(e) = self.discover(&server, None).await {
                tracing::warn!(server = server_name, error = %e, "tool discovery failed");
            }
        }
        Ok(self.tools.tools(server_name))
    }

    /// Force a `tools/list` exchange, replacing the cached list.
    pub async fn refresh_tools(&self, server_name: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let server = self.managed(server_name).await?;
        let _turn = server.turn.lock().await;
        self.ensure_running(&server, None).await?;
        self.discover(&server, None).await
    }

    /// Cached tools of `server_name`, without touching the server.
    pub fn cached_tools(&self, server_name: &str) -> Vec<ToolDescriptor> {
        self.tools.tools(server_name)
    }

    /// Number of successful discovery exchanges for `server_name`.
    pub fn discovery_rounds(&self, server_name: &str) -> u32 {
        self.tools.discovery_rounds(server_name)
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call `tool` on `server_name` with `params`, waiting up to `timeout`.
    ///
    /// Steps:
    /// 1. Start the server if needed (handshake + discovery on start)
    /// 2. Refresh the tool cache once if it is empty
    /// 3. Send `tools/call`; on a transport failure retry once with `call_tool`
    ///
    /// `timeout` covers all of these: setup exchanges are cut short so the
    /// call never outlasts it. Only an unknown server name or a failed spawn
    /// is returned as `Err`; every other failure is reported as `ok: false`.
    pub async fn call(
        &self,
        server_name: &str,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallResult, McpError> {
        let server = self.managed(server_name).await?;
        let _turn = server.turn.lock().await;
        let start = Instant::now();
        let deadline = start + timeout;
        self.ensure_running(&server, Some(deadline)).await?;

        if self.tools.is_empty(server_name) && Instant::now() < deadline {
            if let Err(e) = self.discover(&server, Some(deadline)).await {
                tracing::warn!(server = server_name, error = %e, "tool discovery failed");
            }
        }
        if !self.tools.contains(server_name, tool) {
            tracing::info!(server = server_name, tool, "tool not in cache; calling anyway");
        }

        let process = &server.process;
        let arguments = &params;
        let result = call_with_fallback(server_name, tool, |convention| {
            let request = JsonRpcRequest::new(
                convention.method(),
                ToolCallParams {
                    name: tool,
                    arguments,
                },
            );
            async move { transport::exchange_until(process, &request, deadline, timeout).await }
        })
        .await;

        tracing::info!(
            server = server_name,
            tool,
            ok = result.ok,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tool call finished"
        );
        Ok(result)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of servers with a live process, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        let servers: Vec<(String, Arc<ManagedServer>)> = self
            .servers
            .lock()
            .await
            .iter()
            .map(|(name, server)| (name.clone(), Arc::clone(server)))
            .collect();

        let mut running = Vec::new();
        for (name, server) in servers {
            if server.process.is_running().await {
                running.push(name);
            }
        }
        running.sort();
        running
    }

    pub async fn is_server_running(&self, name: &str) -> bool {
        let server = self.servers.lock().await.get(name).cloned();
        match server {
            Some(server) => server.process.is_running().await,
            None => false,
        }
    }

    /// OS process id of a running server.
    pub async fn server_pid(&self, name: &str) -> Option<u32> {
        let server = self.servers.lock().await.get(name).cloned()?;
        server.process.pid().await
    }
}

/// Wait `timeout` from now, cut short at `deadline`. Returns the end of the
/// wait and its length.
fn cap(timeout: Duration, deadline: Option<Instant>) -> (Instant, Duration) {
    let now = Instant::now();
    let until = deadline.map_or(now + timeout, |deadline| (now + timeout).min(deadline));
    (until, until.saturating_duration_since(now))
}

// ─── Call Conventions ────────────────────────────────────────────────────────

/// Run `attempt` with the primary convention, falling back to the legacy one.
///
/// The fallback runs exactly once, and only when the primary attempt failed
/// at the transport level. A response (success or protocol error) or a
/// timeout is final.
async fn call_with_fallback<F, Fut>(server: &str, tool: &str, mut attempt: F) -> CallResult
where
    F: FnMut(CallConvention) -> Fut,
    Fut: Future<Output = Result<Value, McpError>>,
{
    let primary = CallConvention::Primary.method();
    let legacy = CallConvention::Legacy.method();

    let primary_error = match attempt(CallConvention::Primary).await {
        Ok(response) => return transport::to_call_result(response),
        Err(e) if e.is_transport() => e,
        Err(e) => {
            tracing::error!(server, tool, error = %e, "{primary} failed");
            return CallResult::failure(e.to_string());
        }
    };

    tracing::warn!(server, tool, error = %primary_error, "{primary} failed; retrying with {legacy}");
    match attempt(CallConvention::Legacy).await {
        Ok(response) => transport::to_call_result(response),
        Err(legacy_error) => {
            tracing::error!(server, tool, error = %legacy_error, "{legacy} failed");
            CallResult::failure(format!(
                "both {primary} and {legacy} failed: {primary}: {primary_error}; {legacy}: {legacy_error}"
            ))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_REPLY: &str = r#"s|^{"jsonrpc":"2.0","id":"\([^"]*\)","method":"initialize".*$|{"jsonrpc":"2.0","id":"\1","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sed"}}}|"#;
    const LIST_REPLY: &str = r#"s|^{"jsonrpc":"2.0","id":"\([^"]*\)","method":"tools/list".*$|{"jsonrpc":"2.0","id":"\1","result":{"tools":[{"name":"ping","description":"Echo the call back","inputSchema":{"type":"object"}}]}}|"#;
    const ECHO_REPLY: &str = r#"s|^{"jsonrpc":"2.0","id":"\([^"]*\)","method":"[a-z_/]*","params":{"name":"\([^"]*\)","arguments":\(.*\)}}$|{"jsonrpc":"2.0","id":"\1","result":{"tool":"\2","params":\3}}|"#;
    const ERROR_REPLY: &str = r#"s|^{"jsonrpc":"2.0","id":"\([^"]*\)","method":"tools/call".*$|{"jsonrpc":"2.0","id":"\1","error":{"code":-32601,"message":"Method not found"}}|"#;
    const LEGACY_REPLY: &str = r#"s|^{"jsonrpc":"2.0","id":"\([^"]*\)","method":"call_tool".*$|{"jsonrpc":"2.0","id":"\1","result":"legacy"}|"#;
    const QUIT_ON_CALL: &str = r#"\|"method":"tools/call"|Q"#;

    /// Answers `initialize`, ignores the first `tools/list`, answers the
    /// second one, and replies `"done"` to anything else.
    const SLOW_LIST_SCRIPT: &str = r#"
lists=0
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      lists=$((lists + 1))
      if [ "$lists" -gt 1 ]; then
        printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"late"}]}}\n' "$id"
      fi ;;
    *)
      printf '{"jsonrpc":"2.0","id":"%s","result":"done"}\n' "$id" ;;
  esac
done
"#;

    /// A `sed` process answering each request line with the given substitutions.
    fn sed_server(name: &str, scripts: &[&str]) -> ServerConfig {
        let mut command = vec!["sed".to_string(), "-u".to_string()];
        for script in scripts {
            command.push("-e".to_string());
            command.push(script.to_string());
        }
        ServerConfig::new(name, command)
    }

    fn silent_server(name: &str) -> ServerConfig {
        ServerConfig::new(
            name,
            vec!["sh".into(), "-c".into(), "cat > /dev/null".into()],
        )
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            handshake_timeout: Duration::from_millis(100),
            discovery_timeout: Duration::from_millis(100),
            ..ClientOptions::default()
        }
    }

    fn client_with(servers: Vec<ServerConfig>) -> McpClient {
        let configs = servers
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();
        McpClient::new(configs, fast_options())
    }

    fn echo_client() -> McpClient {
        client_with(vec![sed_server("echo", &[INIT_REPLY, LIST_REPLY, ECHO_REPLY])])
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.handshake_timeout, Duration::from_secs(10));
        assert_eq!(options.protocol_version, "2024-11-05");
        assert_eq!(options.client_name, "toolfleet");
    }

    #[test]
    fn test_configured_servers_sorted() {
        let client = client_with(vec![silent_server("zeta"), silent_server("alpha")]);
        assert_eq!(client.configured_servers(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_call_echo_server() {
        let client = echo_client();
        let result = client
            .call("echo", "ping", json!({"x": 1}), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            result,
            CallResult::success(json!({"tool": "ping", "params": {"x": 1}}))
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_call_starts_server_lazily_once() {
        let client = echo_client();
        assert!(!client.is_server_running("echo").await);
        assert!(client.running_servers().await.is_empty());

        client
            .call("echo", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        let pid = client.server_pid("echo").await;
        assert!(pid.is_some());
        assert_eq!(client.running_servers().await, vec!["echo"]);

        client
            .call("echo", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.server_pid("echo").await, pid);
        client.close().await;
    }

    #[tokio::test]
    async fn test_discovery_cached_and_reused() {
        let client = echo_client();
        client.ensure_started("echo").await.unwrap();

        let tools = client.cached_tools("echo");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
        assert_eq!(client.discovery_rounds("echo"), 1);

        client
            .call("echo", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        client
            .call("echo", "not-advertised", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.discovery_rounds("echo"), 1, "no second discovery round");

        assert_eq!(client.list_tools("echo").await.unwrap().len(), 1);
        assert_eq!(client.discovery_rounds("echo"), 1);

        client.refresh_tools("echo").await.unwrap();
        assert_eq!(client.discovery_rounds("echo"), 2);
        client.close().await;
    }

    #[tokio::test]
    async fn test_tool_missing_from_cache_is_still_called() {
        let client = echo_client();
        let result = client
            .call("echo", "unlisted", json!({"a": true}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.data.unwrap()["tool"], "unlisted");
        client.close().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let client = client_with(vec![silent_server("silent")]);
        client.ensure_started("silent").await.unwrap();
        assert!(client.cached_tools("silent").is_empty());

        let timeout = Duration::from_secs(1);
        let started = std::time::Instant::now();
        let result = client
            .call("silent", "x", json!({}), timeout)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(!result.ok);
        let message = result.error.unwrap().as_str().unwrap().to_string();
        assert!(message.contains("timed out"), "{message}");
        assert!(!message.contains("call_tool"), "timeouts must not fall back");
        assert!(elapsed >= timeout);
        // The discovery refresh runs inside the call's own timeout.
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

        // The server is left running after a timeout.
        assert!(client.is_server_running("silent").await);
        client.close().await;
    }

    #[tokio::test]
    async fn test_default_options_respect_call_timeout_on_first_call() {
        let configs = HashMap::from([("silent".to_string(), silent_server("silent"))]);
        let client = McpClient::new(configs, ClientOptions::default());
        let timeout = Duration::from_secs(1);

        // First call: lazy start, handshake and discovery all share the 1s.
        let started = std::time::Instant::now();
        let result = client.call("silent", "x", json!({}), timeout).await.unwrap();
        let elapsed = started.elapsed();
        assert!(!result.ok);
        let message = result.error.unwrap().as_str().unwrap().to_string();
        assert!(message.contains("timed out after 1000ms"), "{message}");
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

        // Second call: the empty-cache refresh is bounded the same way.
        let started = std::time::Instant::now();
        let result = client.call("silent", "x", json!({}), timeout).await.unwrap();
        let elapsed = started.elapsed();
        assert!(!result.ok);
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

        client.close().await;
    }

    #[tokio::test]
    async fn test_empty_cache_refreshed_by_next_call() {
        let client = client_with(vec![ServerConfig::new(
            "lazy",
            vec!["sh".into(), "-c".into(), SLOW_LIST_SCRIPT.into()],
        )]);

        // Discovery at start goes unanswered.
        client.ensure_started("lazy").await.unwrap();
        assert!(client.cached_tools("lazy").is_empty());
        assert_eq!(client.discovery_rounds("lazy"), 0);

        let result = client
            .call("lazy", "late", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, CallResult::success(json!("done")));
        assert_eq!(client.discovery_rounds("lazy"), 1);
        let names: Vec<String> = client
            .cached_tools("lazy")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["late"]);

        // The filled cache is reused.
        client
            .call("lazy", "late", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.discovery_rounds("lazy"), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unknown_server_spawns_nothing() {
        let client = echo_client();
        let err = client
            .call("missing", "x", json!({}), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { ref name } if name == "missing"));
        assert!(client.running_servers().await.is_empty());
        assert!(client.servers.lock().await.is_empty());

        let err = client.ensure_started("missing").await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
        let err = client.stop_server("missing").await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let client = client_with(vec![ServerConfig::new(
            "ghost",
            vec!["/nonexistent/toolfleet-ghost".into()],
        )]);
        let err = client
            .call("ghost", "x", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert!(!client.is_server_running("ghost").await);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let client = client_with(vec![sed_server(
            "strict",
            &[INIT_REPLY, LIST_REPLY, ERROR_REPLY, LEGACY_REPLY],
        )]);
        let result = client
            .call("strict", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            result,
            CallResult::failure(json!({"code": -32601, "message": "Method not found"}))
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_crash_reports_both_conventions_then_respawns() {
        let client = client_with(vec![sed_server(
            "crashy",
            &[QUIT_ON_CALL, INIT_REPLY, LIST_REPLY],
        )]);
        let result = client
            .call("crashy", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!result.ok);
        let message = result.error.unwrap().as_str().unwrap().to_string();
        assert!(message.contains("tools/call"), "{message}");
        assert!(message.contains("call_tool"), "{message}");

        for _ in 0..50 {
            if !client.is_server_running("crashy").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!client.is_server_running("crashy").await);

        // The dead process is noticed and replaced on the next use.
        client.ensure_started("crashy").await.unwrap();
        assert!(client.is_server_running("crashy").await);
        client.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let client = echo_client();
        let timeout = Duration::from_secs(5);
        let (a, b) = tokio::join!(
            client.call("echo", "first", json!({"n": 1}), timeout),
            client.call("echo", "second", json!({"n": 2}), timeout),
        );

        let a = a.unwrap().data.unwrap();
        let b = b.unwrap().data.unwrap();
        assert_eq!(a, json!({"tool": "first", "params": {"n": 1}}));
        assert_eq!(b, json!({"tool": "second", "params": {"n": 2}}));
        client.close().await;
    }

    #[tokio::test]
    async fn test_stop_server_then_call_respawns() {
        let client = echo_client();
        client.ensure_started("echo").await.unwrap();
        let pid = client.server_pid("echo").await;

        client.stop_server("echo").await.unwrap();
        assert!(!client.is_server_running("echo").await);
        // Stopping again is harmless.
        client.stop_server("echo").await.unwrap();

        let result = client
            .call("echo", "ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);
        assert_ne!(client.server_pid("echo").await, pid);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let client = echo_client();
        client.ensure_started("echo").await.unwrap();
        client.close().await;
        assert!(client.running_servers().await.is_empty());
        assert!(client.cached_tools("echo").is_empty());
    }

    // ─── Fallback ────────────────────────────────────────────────────────

    fn transport_error() -> McpError {
        McpError::TransportError {
            server: "s".into(),
            reason: "broken pipe".into(),
        }
    }

    #[tokio::test]
    async fn test_fallback_after_transport_failure() {
        let mut seen = Vec::new();
        let result = call_with_fallback("s", "t", |convention| {
            seen.push(convention);
            let outcome = match convention {
                CallConvention::Primary => Err(transport_error()),
                CallConvention::Legacy => Ok(json!({"result": {"legacy": true}})),
            };
            async move { outcome }
        })
        .await;

        assert_eq!(seen, vec![CallConvention::Primary, CallConvention::Legacy]);
        assert_eq!(result, CallResult::success(json!({"legacy": true})));
    }

    #[tokio::test]
    async fn test_fallback_error_passed_through() {
        let result = call_with_fallback("s", "t", |convention| {
            let outcome = match convention {
                CallConvention::Primary => Err(McpError::NotStarted { name: "s".into() }),
                CallConvention::Legacy => Ok(json!({"error": {"code": 1, "message": "nope"}})),
            };
            async move { outcome }
        })
        .await;
        assert_eq!(result, CallResult::failure(json!({"code": 1, "message": "nope"})));
    }

    #[tokio::test]
    async fn test_no_fallback_on_protocol_error() {
        let mut seen = Vec::new();
        let result = call_with_fallback("s", "t", |convention| {
            seen.push(convention);
            async move { Ok(json!({"error": {"code": -32000, "message": "bad"}})) }
        })
        .await;

        assert_eq!(seen, vec![CallConvention::Primary]);
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn test_no_fallback_on_timeout() {
        let mut seen = Vec::new();
        let result = call_with_fallback("s", "t", |convention| {
            seen.push(convention);
            async move {
                Err(McpError::Timeout {
                    server: "s".into(),
                    method: "tools/call".into(),
                    timeout_ms: 10,
                })
            }
        })
        .await;

        assert_eq!(seen, vec![CallConvention::Primary]);
        assert_eq!(
            result.error,
            Some(json!("server 's' timed out after 10ms waiting for tools/call"))
        );
    }

    #[tokio::test]
    async fn test_both_conventions_fail() {
        let mut seen = Vec::new();
        let result = call_with_fallback("s", "t", |convention| {
            seen.push(convention);
            async move { Err::<Value, _>(transport_error()) }
        })
        .await;

        assert_eq!(seen.len(), 2, "exactly one fallback attempt");
        let message = result.error.unwrap().as_str().unwrap().to_string();
        assert!(message.starts_with("both tools/call and call_tool failed"));
        assert!(message.contains("broken pipe"));
    }
}
