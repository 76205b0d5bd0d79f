//! Fixed-interval driver with "skip tick if the previous run is still in
//! flight" semantics. Reused by the rescuer, the leader heartbeat, and the
//! periodic engine rather than each rolling its own timer loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

type Task = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A single armed timer. `Scheduler::start` spawns the tick loop;
/// `Scheduler::stop` cancels it and waits for any in-flight tick to
/// observe the cancellation.
pub struct Scheduler {
    name: String,
    interval: Duration,
    run_on_start: bool,
    task: Arc<Task>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// `task` is the async closure to run each tick. It must not panic -
    /// the scheduler swallows its errors by construction (the closure's
    /// return type is `()`; fallible work should log its own failures
    /// before returning).
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, run_on_start: bool, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::new(move || Box::pin(task()));
        Self {
            name: name.into(),
            interval,
            run_on_start,
            task: Arc::new(task),
            busy: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Arm the interval. Starting an already-started scheduler replaces
    /// the previous loop.
    pub fn start(&mut self) {
        self.stop_handle();
        let interval = self.interval;
        let run_on_start = self.run_on_start;
        let task = self.task.clone();
        let busy = self.busy.clone();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            if run_on_start {
                Self::run_tick(&name, &busy, &task).await;
            }
            loop {
                ticker.tick().await;
                Self::run_tick(&name, &busy, &task).await;
            }
        });
        self.handle = Some(handle);
    }

    async fn run_tick(name: &str, busy: &Arc<AtomicBool>, task: &Arc<Task>) {
        if busy.swap(true, Ordering::SeqCst) {
            tracing::debug!(scheduler = name, "skipping tick: previous run still in flight");
            return;
        }
        task().await;
        busy.store(false, Ordering::SeqCst);
    }

    fn stop_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Cancel the interval and clear state. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_handle();
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_handle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn run_on_start_fires_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut scheduler = Scheduler::new("test", Duration::from_secs(60), true, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn skips_tick_when_previous_still_running() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut scheduler = Scheduler::new("test", Duration::from_millis(10), true, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        scheduler.start();
        // Several intervals elapse while the first tick is still sleeping.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_prevents_further_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut scheduler = Scheduler::new("test", Duration::from_millis(10), false, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.stop();
        let seen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
