//! Tool lists discovered from each server.
//!
//! Entries are advisory: a call goes ahead even when the requested tool is
//! missing, because some servers answer `tools/list` unreliably.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::types::ToolDescriptor;

// ─── ToolCache ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CacheEntry {
    tools: Vec<ToolDescriptor>,
    /// Number of successful discovery exchanges stored for this server.
    discovery_rounds: u32,
}

/// Per-server tool lists, in the order the server reported them.
#[derive(Debug, Default)]
pub struct ToolCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the tool list for `server` with a fresh discovery result.
    pub fn store(&self, server: &str, tools: Vec<ToolDescriptor>) {
        let mut entries = self.write();
        let entry = entries.entry(server.to_string()).or_default();
        entry.tools = tools;
        entry.discovery_rounds += 1;
    }

    /// Cached tools for `server` (empty if never discovered).
    pub fn tools(&self, server: &str) -> Vec<ToolDescriptor> {
        self.read()
            .get(server)
            .map(|entry| entry.tools.clone())
            .unwrap_or_default()
    }

    /// Whether `server` has no cached tools.
    pub fn is_empty(&self, server: &str) -> bool {
        self.read()
            .get(server)
            .map_or(true, |entry| entry.tools.is_empty())
    }

    /// Whether `server` advertised a tool called `tool`.
    pub fn contains(&self, server: &str, tool: &str) -> bool {
        self.read()
            .get(server)
            .is_some_and(|entry| entry.tools.iter().any(|t| t.name == tool))
    }

    pub fn discovery_rounds(&self, server: &str) -> u32 {
        self.read()
            .get(server)
            .map_or(0, |entry| entry.discovery_rounds)
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
