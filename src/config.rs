//! Endpoint configuration lookup.
//!
//! A thin read-only view over a JSON settings document, addressed by
//! dotted key. The pipeline only consults it to resolve remote pub/sub
//! endpoints in distributed deployments.

use std::path::Path;

use serde_json::Value;

/// Read-only configuration lookup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: Value,
}

impl Settings {
    /// An empty settings document; every lookup misses.
    pub fn empty() -> Self {
        Self { root: Value::Null }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Load settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let root = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self { root })
    }

    /// Look up a value by dotted key, e.g. `"ipc_interface.camera1_host"`.
    ///
    /// Scalars are returned without JSON quoting.
    pub fn get(&self, dotted: &str) -> Option<String> {
        let mut node = &self.root;
        for part in dotted.split('.') {
            node = node.get(part)?;
        }
        match node {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
