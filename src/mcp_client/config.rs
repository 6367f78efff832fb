//! Server registry loading.
//!
//! Reads `servers.yaml` and expands `~`, `$VAR`, `${VAR}` and
//! `${VAR:-default}` in every command argument, `cwd` and `env` value.
//! Expansion happens here, once, never at call time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::McpError;
use super::types::ServerConfig;

/// Environment variable overriding the registry location.
pub const CONFIG_ENV_VAR: &str = "TOOLFLEET_CONFIG";

// ─── File Format ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: HashMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    command: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Default registry path: `$TOOLFLEET_CONFIG`, else
/// `<config dir>/toolfleet/servers.yaml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(expand(&path));
        }
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolfleet")
        .join("servers.yaml")
}

/// Load the server registry at `path`.
///
/// Returns a fresh map on every call; callers are expected to keep it.
pub fn load(path: &Path) -> Result<HashMap<String, ServerConfig>, McpError> {
    if !path.exists() {
        return Err(McpError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse(&raw)
}

/// Parse registry YAML text.
pub fn parse(raw: &str) -> Result<HashMap<String, ServerConfig>, McpError> {
    // An empty document is a registry with no servers.
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let file: RegistryFile = serde_yaml::from_str(raw).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse server registry: {e}"),
    })?;

    let mut servers = HashMap::with_capacity(file.servers.len());
    for (name, entry) in file.servers {
        if entry.command.is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }

        let config = ServerConfig {
            name: name.clone(),
            command: entry.command.iter().map(|arg| expand(arg)).collect(),
            cwd: entry.cwd.as_deref().map(|cwd| PathBuf::from(expand(cwd))),
            env: entry
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand(v)))
                .collect(),
        };
        tracing::info!(server = %name, command = ?config.command, "loaded server entry");
        servers.insert(name, config);
    }

    Ok(servers)
}

// ─── Placeholder Expansion ───────────────────────────────────────────────────

/// Expand environment references, then a leading `~`.
pub fn expand(value: &str) -> String {
    expand_tilde(&expand_vars(value))
}

/// Replace `$VAR`, `${VAR}` and `${VAR:-default}`.
///
/// References to unset variables without a default are kept verbatim.
fn expand_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(idx) = rest.find('$') {
        result.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            let Some(end) = braced.find('}') else {
                result.push_str(&rest[idx..]);
                return result;
            };
            let expr = &braced[..end];
            match resolve_braced(expr) {
                Some(value) => result.push_str(&value),
                None => result.push_str(&rest[idx..idx + 2 + end + 1]),
            }
            rest = &braced[end + 1..];
        } else {
            let name_len = after
                .char_indices()
                .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            if name_len == 0 {
                result.push('$');
            } else {
                let name = &after[..name_len];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push('$');
                        result.push_str(name);
                    }
                }
            }
            rest = &after[name_len..];
        }
    }

    result.push_str(rest);
    result
}

/// Resolve `VAR` or `VAR:-default`. `None` means "leave the reference as is".
fn resolve_braced(expr: &str) -> Option<String> {
    if let Some(idx) = expr.find(":-") {
        let name = &expr[..idx];
        let default = &expr[idx + 2..];
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Some(value),
            _ => Some(default.to_string()),
        }
    } else {
        std::env::var(expr).ok()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &path[1..]);
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
