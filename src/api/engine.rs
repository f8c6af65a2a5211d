//! Engine control surface
//!
//! `ProxyEngine` owns everything a running proxy needs: settings, rules,
//! shaping, pending breakpoints and the listener task. Several engines can
//! coexist in one process.

use crate::api::events::{EventDispatcher, EventSink};
use crate::config::EngineConfig;
use crate::error::{BreakpointError, EngineError, RuleError};
use crate::models::{
    BreakpointResolution, BreakpointRule, MapRemoteRule, MockRule, PendingBreakpoint,
    RewriteRule,
};
use crate::proxy::cert_manager::{ensure_root, CaPaths, CertManager};
use crate::proxy::server::{run_accept_loop, ProxyContext};
use crate::proxy::state::{RuleSets, SharedState};
use crate::proxy::upstream::{Dialer, DirectDialer};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A rule kind editable through the engine.
pub trait EngineRule: Clone + Send + 'static {
    /// Name used in errors and logs
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn list(rules: &RuleSets) -> &Vec<Self>;
    fn list_mut(rules: &mut RuleSets) -> &mut Vec<Self>;

    fn validate(&self) -> Result<(), RuleError> {
        Ok(())
    }

    /// Called after the rule with `id` was removed.
    fn on_removed(_shared: &SharedState, _id: &str) {}

    /// Called after every rule of this kind was removed.
    fn on_cleared(_shared: &SharedState) {}
}

impl EngineRule for MockRule {
    const KIND: &'static str = "mock";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn list(rules: &RuleSets) -> &Vec<Self> {
        &rules.mocks
    }
    fn list_mut(rules: &mut RuleSets) -> &mut Vec<Self> {
        &mut rules.mocks
    }
}

impl EngineRule for RewriteRule {
    const KIND: &'static str = "rewrite";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn list(rules: &RuleSets) -> &Vec<Self> {
        &rules.rewrites
    }
    fn list_mut(rules: &mut RuleSets) -> &mut Vec<Self> {
        &mut rules.rewrites
    }

    fn validate(&self) -> Result<(), RuleError> {
        regex::Regex::new(&self.pattern)
            .map(|_| ())
            .map_err(|e| RuleError::InvalidRegex {
                pattern: self.pattern.clone(),
                message: e.to_string(),
            })
    }
}

impl EngineRule for MapRemoteRule {
    const KIND: &'static str = "map-remote";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn list(rules: &RuleSets) -> &Vec<Self> {
        &rules.map_remotes
    }
    fn list_mut(rules: &mut RuleSets) -> &mut Vec<Self> {
        &mut rules.map_remotes
    }
}

impl EngineRule for BreakpointRule {
    const KIND: &'static str = "breakpoint";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn list(rules: &RuleSets) -> &Vec<Self> {
        &rules.breakpoints
    }
    fn list_mut(rules: &mut RuleSets) -> &mut Vec<Self> {
        &mut rules.breakpoints
    }

    fn on_removed(shared: &SharedState, id: &str) {
        let released = shared.breakpoints.forward_for_rule(id);
        if released > 0 {
            tracing::info!("Released {} exchanges paused by breakpoint rule {}", released, id);
        }
    }

    fn on_cleared(shared: &SharedState) {
        let released = shared.breakpoints.forward_all();
        if released > 0 {
            tracing::info!("Released {} paused exchanges", released);
        }
    }
}

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ProxyEngine {
    config: EngineConfig,
    shared: Arc<SharedState>,
    dialer: Arc<dyn Dialer>,
    running: Mutex<Option<RunningServer>>,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProxyEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(SharedState::new(&config)),
            config,
            dialer: Arc::new(DirectDialer::new()),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the root CA, bind `127.0.0.1:port` (0 picks a free port) and
    /// start accepting. Returns the bound port.
    pub async fn start(&self, port: u16, sink: Arc<dyn EventSink>) -> Result<u16, EngineError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(current) = self.port() {
            return Err(EngineError::AlreadyRunning(current));
        }

        let storage_dir = self.config.storage_dir.clone();
        let cert_manager = tokio::task::spawn_blocking(move || CertManager::new(&storage_dir))
            .await
            .map_err(|e| EngineError::Certificate(anyhow::Error::new(e)))?
            .map_err(EngineError::Certificate)?;

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| EngineError::Bind { port, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| EngineError::Bind { port, source })?
            .port();

        let ctx = Arc::new(ProxyContext {
            shared: self.shared.clone(),
            events: EventDispatcher::spawn(sink),
            cert_manager: Some(Arc::new(cert_manager)),
            dialer: self.dialer.clone(),
        });
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_accept_loop(listener, ctx, shutdown_rx));

        *self.running() = Some(RunningServer {
            port: bound,
            shutdown,
            task,
        });
        tracing::info!("Proxy server listening on 127.0.0.1:{}", bound);
        Ok(bound)
    }

    /// Stop accepting and release every paused exchange. Connections already
    /// being served run to completion. Returns false when not running.
    pub async fn stop(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(server) = self.running().take() else {
            return false;
        };

        let _ = server.shutdown.send(());
        if let Err(e) = server.task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }
        let released = self.shared.breakpoints.forward_all();
        tracing::info!(
            "Proxy on port {} stopped ({} paused exchanges released)",
            server.port,
            released
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.running().as_ref().map(|server| server.port)
    }

    /// Bytes/second caps; 0 disables a direction's cap.
    pub fn set_limits(&self, upload_bps: u64, download_bps: u64) {
        self.shared.shaper.set_limits(upload_bps, download_bps);
    }

    pub fn set_latency(&self, ms: u64) {
        self.shared.shaper.set_latency(ms);
    }

    pub fn set_mitm_enabled(&self, enabled: bool) {
        self.shared.update(|settings| settings.mitm_enabled = enabled);
    }

    pub fn set_mitm_bypass_patterns(&self, patterns: Vec<String>) {
        self.shared
            .update(|settings| settings.bypass_patterns = patterns);
    }

    pub fn set_ws_enabled(&self, enabled: bool) {
        self.shared.update(|settings| settings.ws_enabled = enabled);
    }

    /// Append a rule, assigning a fresh id when it has none.
    pub fn add_rule<R: EngineRule>(&self, mut rule: R) -> Result<R, RuleError> {
        rule.validate()?;
        if rule.id().is_empty() {
            rule.set_id(Uuid::new_v4().to_string());
        }
        let stored = rule.clone();
        self.shared.update_rules(|rules| R::list_mut(rules).push(rule));
        tracing::debug!("Added {} rule {}", R::KIND, stored.id());
        Ok(stored)
    }

    /// Replace the rule sharing `rule`'s id, keeping its position.
    pub fn update_rule<R: EngineRule>(&self, rule: R) -> Result<(), RuleError> {
        rule.validate()?;
        self.shared.update_rules(|rules| {
            let slot = R::list_mut(rules)
                .iter_mut()
                .find(|existing| existing.id() == rule.id())
                .ok_or_else(|| RuleError::NotFound {
                    kind: R::KIND,
                    id: rule.id().to_string(),
                })?;
            *slot = rule;
            Ok(())
        })
    }

    pub fn remove_rule<R: EngineRule>(&self, id: &str) -> Result<R, RuleError> {
        let removed = self.shared.update_rules(|rules| {
            let list = R::list_mut(rules);
            let index = list
                .iter()
                .position(|rule| rule.id() == id)
                .ok_or_else(|| RuleError::NotFound {
                    kind: R::KIND,
                    id: id.to_string(),
                })?;
            Ok(list.remove(index))
        })?;
        R::on_removed(&self.shared, id);
        Ok(removed)
    }

    pub fn list_rules<R: EngineRule>(&self) -> Vec<R> {
        R::list(&self.shared.snapshot().rules).clone()
    }

    /// Remove every rule of kind `R`. Returns how many were removed.
    pub fn clear_rules<R: EngineRule>(&self) -> usize {
        let cleared = self
            .shared
            .update_rules(|rules| std::mem::take(R::list_mut(rules)).len());
        R::on_cleared(&self.shared);
        cleared
    }

    pub fn resolve_breakpoint(
        &self,
        id: &str,
        resolution: BreakpointResolution,
    ) -> Result<(), BreakpointError> {
        self.shared.breakpoints.resolve(id, resolution)
    }

    /// Paused exchanges, oldest first.
    pub fn pending_breakpoints(&self) -> Vec<PendingBreakpoint> {
        self.shared.breakpoints.pending()
    }

    /// Where the root certificate lives (it may not exist before the first start).
    pub fn cert_path(&self) -> PathBuf {
        CaPaths::in_dir(&self.config.storage_dir).cert
    }

    /// PEM of the root certificate, generating the CA if needed.
    pub fn root_ca_pem(&self) -> anyhow::Result<String> {
        ensure_root(&self.config.storage_dir)?;
        let path = self.cert_path();
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read CA certificate {}", path.display()))
    }
}
