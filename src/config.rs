//! Engine configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hostname fragments that are tunneled without decryption by default.
/// Certificate-pinned apps keep working through these, undecrypted.
pub const DEFAULT_BYPASS_PATTERNS: &[&str] = &[
    "cdn",
    "static",
    "akamai",
    "cloudfront",
    "fastly",
    "fbcdn",
    "googlevideo",
];

const DEFAULT_CAPTURE_LIMIT: usize = 100 * 1024 * 1024;
const DEFAULT_BREAKPOINT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_PENDING_BREAKPOINTS: usize = 20;

/// Settings applied when a `ProxyEngine` is constructed.
///
/// Everything except the storage location can also be changed at runtime
/// through the engine's setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the root CA material
    pub storage_dir: PathBuf,
    /// Whether CONNECT tunnels are decrypted
    pub mitm_enabled: bool,
    /// Whether WebSocket upgrades are allowed through
    pub ws_enabled: bool,
    /// Hostname substrings tunneled without decryption
    pub bypass_patterns: Vec<String>,
    /// Upload cap in bytes/second (0 = unlimited)
    pub upload_bps: u64,
    /// Download cap in bytes/second (0 = unlimited)
    pub download_bps: u64,
    /// Fixed artificial latency in milliseconds
    pub latency_ms: u64,
    /// Upper bound on captured bytes per body
    pub capture_limit_bytes: usize,
    pub breakpoint_timeout_secs: u64,
    pub max_pending_breakpoints: usize,
    /// Optional plaintext debug log
    pub debug_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            mitm_enabled: true,
            ws_enabled: true,
            bypass_patterns: DEFAULT_BYPASS_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            upload_bps: 0,
            download_bps: 0,
            latency_ms: 0,
            capture_limit_bytes: DEFAULT_CAPTURE_LIMIT,
            breakpoint_timeout_secs: DEFAULT_BREAKPOINT_TIMEOUT_SECS,
            max_pending_breakpoints: DEFAULT_MAX_PENDING_BREAKPOINTS,
            debug_log: None,
        }
    }
}

impl EngineConfig {
    /// Config rooted at `storage_dir` with every other field defaulted
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn breakpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.breakpoint_timeout_secs)
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("tapline"))
        .unwrap_or_else(|| PathBuf::from("./tapline_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"mitm_enabled": false, "latency_ms": 250}"#).unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert!(!config.mitm_enabled);
        assert_eq!(config.latency_ms, 250);
        assert!(config.ws_enabled);
        assert_eq!(config.max_pending_breakpoints, 20);
        assert_eq!(config.breakpoint_timeout(), Duration::from_secs(120));
        assert!(config.bypass_patterns.iter().any(|p| p == "cdn"));
    }
}
