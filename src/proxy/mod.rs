//! HTTP/HTTPS/WebSocket interception
//!
//! The listener and per-connection loops live in `server`; one request's
//! trip through the rules and upstream lives in `exchange`. The rest are the
//! building blocks they share.

pub mod body;
pub mod breakpoints;
pub mod cert_manager;
pub mod exchange;
pub mod http1;
pub mod rules;
pub mod server;
pub mod shaping;
pub mod state;
pub mod upstream;
pub mod websocket;
