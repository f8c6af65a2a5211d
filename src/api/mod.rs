//! Public API: the engine handle and the events it emits.

pub mod engine;
pub mod events;

pub use engine::{EngineRule, ProxyEngine};
pub use events::{EventSink, ProxyEvent};
