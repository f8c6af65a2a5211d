//! Error types surfaced through the engine control surface.

use thiserror::Error;

/// Setup failures returned synchronously from `ProxyEngine::start`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("proxy engine is already running on port {0}")]
    AlreadyRunning(u16),

    #[error("failed to prepare root certificate authority: {0:#}")]
    Certificate(anyhow::Error),

    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Failures resolving a paused exchange.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("breakpoint {0} is not pending (unknown or already resolved)")]
    NotPending(String),
}

/// Rule CRUD failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("no {kind} rule with id {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
}
