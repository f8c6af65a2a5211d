//! Engine-wide mutable state shared by every connection.

use crate::config::EngineConfig;
use crate::models::{BreakpointRule, MapRemoteRule, MockRule, RewriteRule};
use crate::proxy::breakpoints::BreakpointCoordinator;
use crate::proxy::rules::RegexCache;
use crate::proxy::shaping::Shaper;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct RuleSets {
    pub mocks: Vec<MockRule>,
    pub rewrites: Vec<RewriteRule>,
    pub map_remotes: Vec<MapRemoteRule>,
    pub breakpoints: Vec<BreakpointRule>,
}

/// Settings read at the start of each exchange or tunnel.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mitm_enabled: bool,
    pub ws_enabled: bool,
    pub bypass_patterns: Vec<String>,
    /// Copied on write so readers hold a consistent snapshot
    pub rules: Arc<RuleSets>,
}

impl Settings {
    /// Whether `host` is tunneled without decryption.
    pub fn is_bypassed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.bypass_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| host.contains(&p.to_ascii_lowercase()))
    }
}

pub struct SharedState {
    settings: Mutex<Settings>,
    pub shaper: Shaper,
    pub breakpoints: BreakpointCoordinator,
    pub regex: RegexCache,
    pub capture_limit: usize,
}

impl SharedState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            settings: Mutex::new(Settings {
                mitm_enabled: config.mitm_enabled,
                ws_enabled: config.ws_enabled,
                bypass_patterns: config.bypass_patterns.clone(),
                rules: Arc::new(RuleSets::default()),
            }),
            shaper: Shaper::new(config.upload_bps, config.download_bps, config.latency_ms),
            breakpoints: BreakpointCoordinator::new(
                config.breakpoint_timeout(),
                config.max_pending_breakpoints,
            ),
            regex: RegexCache::new(),
            capture_limit: config.capture_limit_bytes,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        let mut guard = self
            .settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn update_rules<R>(&self, f: impl FnOnce(&mut RuleSets) -> R) -> R {
        self.update(|settings| f(Arc::make_mut(&mut settings.rules)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_is_case_insensitive_substring() {
        let state = SharedState::new(&EngineConfig::with_storage_dir("/tmp/unused"));
        let settings = state.snapshot();
        assert!(settings.is_bypassed("images.CDN.example.com"));
        assert!(settings.is_bypassed("d1.cloudfront.net"));
        assert!(!settings.is_bypassed("api.example.com"));

        state.update(|s| s.bypass_patterns = vec!["Pinned".into(), String::new()]);
        let settings = state.snapshot();
        assert!(settings.is_bypassed("pinned.bank.com"));
        assert!(!settings.is_bypassed("cdn.example.com"));
    }

    #[test]
    fn snapshots_are_unaffected_by_later_rule_edits() {
        let state = SharedState::new(&EngineConfig::with_storage_dir("/tmp/unused"));
        let before = state.snapshot();
        state.update_rules(|rules| {
            rules.map_remotes.push(MapRemoteRule {
                id: "m".into(),
                enabled: true,
                url_pattern: "*".into(),
                method: None,
                target: "http://localhost/".into(),
            })
        });
        assert!(before.rules.map_remotes.is_empty());
        assert_eq!(state.snapshot().rules.map_remotes.len(), 1);
    }
}
