//! Lease-based single-elected-instance primitive over the `Store`.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct LeaderElectionOptions {
    pub heartbeat_interval_ms: u64,
    pub lease_duration_ms: i64,
}

impl Default for LeaderElectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            lease_duration_ms: 30_000,
        }
    }
}

fn generate_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let disambiguator: u32 = fastrand::u32(..);
    format!("{host}:{}:{disambiguator:08x}", process::id())
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Heartbeat-driven leadership over a `singleton_key`. Only one instance
/// across a fleet holds the lease at a time.
pub struct LeaderElection {
    store: Arc<dyn Store>,
    singleton_key: String,
    instance_id: String,
    options: LeaderElectionOptions,
    is_leader: Arc<AtomicBool>,
    on_become_leader: Mutex<Option<Callback>>,
    on_lose_leadership: Mutex<Option<Callback>>,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn Store>, singleton_key: impl Into<String>, options: LeaderElectionOptions) -> Self {
        Self {
            store,
            singleton_key: singleton_key.into(),
            instance_id: generate_instance_id(),
            options,
            is_leader: Arc::new(AtomicBool::new(false)),
            on_become_leader: Mutex::new(None),
            on_lose_leadership: Mutex::new(None),
        }
    }

    /// Register the callback fired when this instance becomes leader.
    /// Interior-mutable so it can be wired up after the election is already
    /// behind an `Arc` (e.g. by `PeriodicEngine`, which needs a handle to
    /// the same `Arc<LeaderElection>` the facade already constructed).
    pub async fn set_on_become_leader(&self, f: Callback) {
        *self.on_become_leader.lock().await = Some(f);
    }

    /// Register the callback fired when this instance loses leadership.
    pub async fn set_on_lose_leadership(&self, f: Callback) {
        *self.on_lose_leadership.lock().await = Some(f);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Wrap this election in a `Scheduler` armed at the heartbeat interval.
    pub fn into_scheduler(self: Arc<Self>) -> Scheduler {
        let election = self.clone();
        Scheduler::new(
            "leader-election-heartbeat",
            Duration::from_millis(self.options.heartbeat_interval_ms),
            true,
            move || {
                let election = election.clone();
                async move {
                    election.tick().await;
                }
            },
        )
    }

    async fn tick(&self) {
        let lease_ms = self.options.lease_duration_ms;
        if !self.is_leader() {
            let acquired = self
                .store
                .try_acquire_leadership(&self.singleton_key, &self.instance_id, lease_ms)
                .await
                .unwrap_or(false);
            if acquired {
                self.is_leader.store(true, Ordering::SeqCst);
                tracing::info!(key = %self.singleton_key, instance = %self.instance_id, "became leader");
                if let Some(cb) = self.on_become_leader.lock().await.as_ref() {
                    cb();
                }
            }
        } else {
            let renewed = self
                .store
                .renew_leadership(&self.singleton_key, &self.instance_id, lease_ms)
                .await
                .unwrap_or(false);
            if !renewed {
                self.is_leader.store(false, Ordering::SeqCst);
                tracing::warn!(key = %self.singleton_key, instance = %self.instance_id, "lost leadership");
                if let Some(cb) = self.on_lose_leadership.lock().await.as_ref() {
                    cb();
                }
            }
        }
    }

    /// Best-effort release if leader, regardless cancels the heartbeat
    /// (the caller is expected to stop the `Scheduler` it wrapped this in).
    pub async fn stop(&self) {
        if self.is_leader() {
            let _ = self
                .store
                .release_leadership(&self.singleton_key, &self.instance_id)
                .await;
            self.is_leader.store(false, Ordering::SeqCst);
        }
    }
}
