//! Data models shared between the engine and its consumers.

pub mod breakpoint;
pub mod record;
pub mod rules;
pub mod websocket;

pub use breakpoint::*;
pub use record::*;
pub use rules::*;
pub use websocket::*;
