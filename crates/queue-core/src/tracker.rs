//! In-process bookkeeping of jobs currently executing in this instance.
//!
//! A `DashMap` keyed by job id, with an RAII guard that decrements on drop;
//! there is nothing to accumulate per entry, so the map degenerates to a
//! concurrent set. Held as an explicit, owned dependency by `Worker::start`
//! rather than a process-global - used by the facade's graceful-shutdown
//! wait and by tests that need to assert on in-flight counts without
//! touching the store.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

/// Tracks the set of job ids currently executing in this process.
#[derive(Clone, Default)]
pub struct ExecutionTracker {
    entries: Arc<DashMap<Uuid, ()>>,
    idle: Arc<Notify>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as executing. Returns a guard that removes it on drop.
    pub fn track(&self, id: Uuid) -> TrackGuard {
        self.entries.insert(id, ());
        TrackGuard {
            tracker: self.clone(),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    /// Wait until no jobs are in flight. Used for graceful shutdown.
    pub async fn wait_idle(&self) {
        loop {
            if self.entries.is_empty() {
                return;
            }
            let notified = self.idle.notified();
            if self.entries.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn untrack(&self, id: Uuid) {
        self.entries.remove(&id);
        if self.entries.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Removes its job id from the tracker when dropped, even if the chunk task
/// panics mid-execution.
pub struct TrackGuard {
    tracker: ExecutionTracker,
    id: Uuid,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.tracker.untrack(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_and_untrack() {
        let tracker = ExecutionTracker::new();
        let id = Uuid::new_v4();
        let guard = tracker.track(id);
        assert!(tracker.contains(id));
        assert_eq!(tracker.count(), 1);
        drop(guard);
        assert!(!tracker.contains(id));
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_once_empty() {
        let tracker = ExecutionTracker::new();
        let id = Uuid::new_v4();
        let guard = tracker.track(id);
        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_idle().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("wait_idle should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_already_empty() {
        let tracker = ExecutionTracker::new();
        tokio::time::timeout(std::time::Duration::from_millis(50), tracker.wait_idle())
            .await
            .expect("wait_idle should not block when nothing is tracked");
    }
}
