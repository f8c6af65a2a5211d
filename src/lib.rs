//! # Tapline Core
//!
//! Intercepting proxy engine for inspecting and manipulating HTTP, HTTPS and
//! WebSocket traffic on the local machine.
//!
//! ## Features
//!
//! - HTTP/1.1 forward proxy with absolute-form and CONNECT support
//! - TLS interception via per-host leaf certificates from a local root CA
//! - Mock, rewrite, map-remote and breakpoint rules
//! - WebSocket frame capture
//! - Bandwidth caps and artificial latency
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Embedding app (UI, CLI, tests)             │
//! ├─────────────────────────────────────────────────────────┤
//! │        ProxyEngine (control)   /   EventSink (events)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌─────────┐  ┌──────────┐  ┌────────┐  ┌───────────┐   │
//! │  │  Proxy  │  │   TLS    │  │ Rules  │  │   Body    │   │
//! │  │ Server  │──│   MITM   │──│ Engine │──│ Pipeline  │   │
//! │  └─────────┘  └──────────┘  └────────┘  └───────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;

pub use api::{EngineRule, EventSink, ProxyEngine, ProxyEvent};
pub use config::EngineConfig;
pub use error::{BreakpointError, EngineError, RuleError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
