//! Event surface consumed by the embedding application.

use crate::models::{PendingBreakpoint, RequestRecord, WsMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something observed by the proxy.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// Partial or terminal snapshot of an HTTP exchange
    Request(RequestRecord),
    WebSocket(WsMessage),
    /// An exchange is parked and waits for `resolve_breakpoint`
    BreakpointHit(PendingBreakpoint),
}

/// Receiver of proxy events. Called from a dedicated dispatch task, in
/// emission order.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: ProxyEvent);
}

impl<F> EventSink for F
where
    F: Fn(ProxyEvent) + Send + Sync + 'static,
{
    fn publish(&self, event: ProxyEvent) {
        self(event)
    }
}

/// Cheap handle used on the forwarding path. Events are queued and delivered
/// to the sink by a background task so slow consumers never stall traffic.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl EventDispatcher {
    /// Dispatcher plus the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Start a task draining events into `sink`. It ends once every
    /// dispatcher clone is dropped.
    pub fn spawn(sink: Arc<dyn EventSink>) -> Self {
        let (dispatcher, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.publish(event);
            }
        });
        dispatcher
    }

    pub fn publish(&self, event: ProxyEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event dropped: sink task has stopped");
        }
    }
}
