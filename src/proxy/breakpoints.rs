use crate::api::events::{EventDispatcher, ProxyEvent};
use crate::error::BreakpointError;
use crate::models::{BreakpointResolution, PendingBreakpoint};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingEntry {
    info: PendingBreakpoint,
    tx: oneshot::Sender<BreakpointResolution>,
}

/// Parks matched exchanges until they are resolved or time out.
pub struct BreakpointCoordinator {
    pending: DashMap<String, PendingEntry>,
    /// Slots taken by parked exchanges; never exceeds `max_pending`
    reserved: AtomicUsize,
    timeout: Duration,
    max_pending: usize,
}

/// A held pending slot. Dropping it frees the slot and forgets the entry,
/// including when the waiting exchange is cancelled.
struct Slot<'a> {
    coordinator: &'a BreakpointCoordinator,
    id: String,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.coordinator.pending.remove(&self.id);
        self.coordinator.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BreakpointCoordinator {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: DashMap::new(),
            reserved: AtomicUsize::new(0),
            timeout,
            max_pending,
        }
    }

    /// Announce `info` and wait for a decision.
    ///
    /// Returns a plain forward when the cap is reached, the wait times out,
    /// or the breakpoint is released by `forward_all`.
    pub async fn pause(
        &self,
        info: PendingBreakpoint,
        events: &EventDispatcher,
    ) -> BreakpointResolution {
        let Some(slot) = self.reserve(&info.id) else {
            tracing::warn!(
                "{} breakpoints already pending, forwarding {} {}",
                self.max_pending,
                info.method,
                info.url
            );
            return BreakpointResolution::forward();
        };

        let id = slot.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingEntry {
                info: info.clone(),
                tx,
            },
        );
        tracing::info!("Breakpoint {} hit: {} {}", id, info.method, info.url);
        events.publish(ProxyEvent::BreakpointHit(info));

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => BreakpointResolution::forward(),
            Err(_) => {
                drop(slot);
                tracing::info!("Breakpoint {} timed out, forwarding unmodified", id);
                BreakpointResolution::forward()
            }
        }
    }

    fn reserve(&self, id: &str) -> Option<Slot<'_>> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.max_pending).then_some(taken + 1)
            })
            .ok()?;
        Some(Slot {
            coordinator: self,
            id: id.to_string(),
        })
    }

    /// Deliver the single accepted resolution for `id`.
    pub fn resolve(&self, id: &str, resolution: BreakpointResolution) -> Result<(), BreakpointError> {
        let (_, entry) = self
            .pending
            .remove(id)
            .ok_or_else(|| BreakpointError::NotPending(id.to_string()))?;
        entry
            .tx
            .send(resolution)
            .map_err(|_| BreakpointError::NotPending(id.to_string()))
    }

    /// Snapshot of parked exchanges, oldest first.
    pub fn pending(&self) -> Vec<PendingBreakpoint> {
        let mut list: Vec<PendingBreakpoint> =
            self.pending.iter().map(|e| e.value().info.clone()).collect();
        list.sort_by_key(|p| p.created_at);
        list
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Release everything unmodified. Returns how many were released.
    pub fn forward_all(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.resolve(id, BreakpointResolution::forward()).is_ok())
            .count()
    }

    /// Release exchanges parked by one rule, e.g. after it was removed.
    pub fn forward_for_rule(&self, rule_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().info.rule_id == rule_id)
            .map(|e| e.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.resolve(id, BreakpointResolution::forward()).is_ok())
            .count()
    }
}
