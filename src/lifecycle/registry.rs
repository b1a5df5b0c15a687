//! Pending response registry.
//!
//! # Responsibilities
//! - Track every reply that outlived its handler (one-shot, long-poll, streaming)
//! - Guarantee each entry is removed exactly once
//! - Let shutdown wait until everything has drained
//!
//! # Design Decisions
//! - Owned by the listener instance, shared through `Arc`
//! - [`Registration`] is an RAII guard: explicit `finish()` or drop unregisters
//! - Double unregistration is a no-op that returns `false`

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::observability::metrics;

/// Identity of one registered reply.
pub type ResponseId = u64;

/// What kind of reply is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    OneShot,
    LongPoll,
    Continuous,
    EventSource,
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PendingKind::OneShot => "one_shot",
            PendingKind::LongPoll => "longpoll",
            PendingKind::Continuous => "continuous",
            PendingKind::EventSource => "eventsource",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one pending reply.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub kind: PendingKind,
    pub label: String,
    pub registered_at: Instant,
}

/// Set of replies that are not finished yet.
#[derive(Debug, Default)]
pub struct PendingResponses {
    entries: DashMap<ResponseId, PendingInfo>,
    next_id: AtomicU64,
    drained: Notify,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry and return the guard that removes it.
    pub fn register(self: &Arc<Self>, kind: PendingKind, label: impl Into<String>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let label = label.into();
        tracing::debug!(response_id = id, kind = %kind, label = %label, "Response pending");
        self.entries.insert(
            id,
            PendingInfo {
                kind,
                label,
                registered_at: Instant::now(),
            },
        );
        metrics::set_pending_responses(self.entries.len());

        Registration {
            id,
            registry: Arc::clone(self),
            finished: false,
        }
    }

    /// Remove an entry. Returns `false` if it was already gone.
    pub fn unregister(&self, id: ResponseId) -> bool {
        let removed = self.entries.remove(&id);
        let len = self.entries.len();
        metrics::set_pending_responses(len);

        match removed {
            Some((_, info)) => {
                tracing::debug!(
                    response_id = id,
                    kind = %info.kind,
                    open_ms = info.registered_at.elapsed().as_millis() as u64,
                    "Response finished"
                );
                if len == 0 {
                    self.drained.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ResponseId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the current entries.
    pub fn snapshot(&self) -> Vec<(ResponseId, PendingInfo)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Resolve once the registry is empty.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Guard for one registry entry.
#[derive(Debug)]
pub struct Registration {
    id: ResponseId,
    registry: Arc<PendingResponses>,
    finished: bool,
}

impl Registration {
    pub fn id(&self) -> ResponseId {
        self.id
    }

    /// Unregister now. Returns `false` if this guard already did.
    pub fn finish(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.registry.unregister(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_finish() {
        let registry = Arc::new(PendingResponses::new());
        let mut reg = registry.register(PendingKind::LongPoll, "db");
        assert!(registry.contains(reg.id()));
        assert_eq!(registry.len(), 1);

        assert!(reg.finish());
        assert!(!reg.finish());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_unregister_is_noop() {
        let registry = Arc::new(PendingResponses::new());
        let reg = registry.register(PendingKind::OneShot, "x");
        let id = reg.id();
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        drop(reg);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = Arc::new(PendingResponses::new());
        {
            let _a = registry.register(PendingKind::Continuous, "a");
            let _b = registry.register(PendingKind::EventSource, "b");
            assert_eq!(registry.snapshot().len(), 2);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(PendingResponses::new());
        registry.wait_until_empty().await;

        let reg = registry.register(PendingKind::OneShot, "slow");
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(reg);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
