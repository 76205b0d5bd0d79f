//! Unified entry point: applies defaults, partition scoping, and owns the
//! lifecycle of every background process (rescuer, leader election,
//! workers).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::leader::{LeaderElection, LeaderElectionOptions};
use crate::model::{NewJob, Queue, QueueSpec};
use crate::processor::{Handler, JobProcessor, OnJobFailed, OnJobProcessed, ProcessorOptions};
use crate::rescuer::{Rescuer, RescuerOptions};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::tracker::ExecutionTracker;
use crate::worker::{Worker, WorkerOptions};

#[derive(Debug, Clone)]
pub struct FacadeOptions {
    pub partition_key: String,
    pub max_payload_size_kb: usize,
    pub rescuer: RescuerOptions,
    pub leader_election: LeaderElectionOptions,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            partition_key: "default".to_string(),
            max_payload_size_kb: 16,
            rescuer: RescuerOptions::default(),
            leader_election: LeaderElectionOptions::default(),
        }
    }
}

/// Options accepted by [`Facade::work`].
#[derive(Clone)]
pub struct WorkOptions {
    pub worker: WorkerOptions,
    pub processor: ProcessorOptions,
    pub concurrency: usize,
    pub on_job_processed: Option<OnJobProcessed>,
    pub on_job_failed: Option<OnJobFailed>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            processor: ProcessorOptions::default(),
            concurrency: 1,
            on_job_processed: None,
            on_job_failed: None,
        }
    }
}

pub struct Facade {
    store: Arc<dyn Store>,
    options: FacadeOptions,
    rescuer_scheduler: Mutex<Option<Scheduler>>,
    leader_election: Arc<LeaderElection>,
    leader_scheduler: Mutex<Option<Scheduler>>,
    workers: Mutex<HashMap<String, Vec<Worker>>>,
    trackers: Mutex<HashMap<String, ExecutionTracker>>,
}

impl Facade {
    pub fn new(store: Arc<dyn Store>, options: FacadeOptions) -> Arc<Self> {
        let leader_election = Arc::new(LeaderElection::new(
            store.clone(),
            "periodic-engine",
            options.leader_election,
        ));
        Arc::new(Self {
            store,
            options,
            rescuer_scheduler: Mutex::new(None),
            leader_election,
            leader_scheduler: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn leader_election(&self) -> Arc<LeaderElection> {
        self.leader_election.clone()
    }

    pub fn options(&self) -> &FacadeOptions {
        &self.options
    }

    /// Runs migrations, then starts the rescuer and leader-election
    /// heartbeat schedulers.
    pub async fn global_initialize(&self) -> Result<()> {
        self.store.run_migrations().await?;

        let rescuer = Arc::new(Rescuer::new(self.store.clone(), self.options.rescuer));
        let mut rescuer_scheduler = rescuer.into_scheduler();
        rescuer_scheduler.start();
        *self.rescuer_scheduler.lock().await = Some(rescuer_scheduler);

        let mut leader_scheduler = self.leader_election.clone().into_scheduler();
        leader_scheduler.start();
        *self.leader_scheduler.lock().await = Some(leader_scheduler);

        Ok(())
    }

    /// Stops schedulers and aborts every worker spawned through this
    /// facade. Does not close the underlying connection pool - that is the
    /// caller's `Store` implementation's responsibility.
    pub async fn dispose(&self) {
        if let Some(mut s) = self.rescuer_scheduler.lock().await.take() {
            s.stop();
        }
        if let Some(mut s) = self.leader_scheduler.lock().await.take() {
            s.stop();
        }
        self.leader_election.stop().await;

        let mut workers = self.workers.lock().await;
        for (_, group) in workers.drain() {
            for mut worker in group {
                worker.stop().await;
            }
        }
        drop(workers);
        self.trackers.lock().await.clear();
    }

    /// Drops every table this store owns. Intended for throwaway test
    /// environments, never production.
    pub async fn global_destroy(&self) -> Result<()> {
        self.dispose().await;
        self.store.drop_all_tables().await
    }

    /// Stops workers targeting `partition_key`, then deletes every queue
    /// (and, by cascade, every job) in that partition.
    pub async fn purge(&self, partition_key: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let keys: Vec<String> = workers
            .keys()
            .filter(|k| k.starts_with(&format!("{partition_key}\0")))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(group) = workers.remove(key) {
                for mut worker in group {
                    worker.stop().await;
                }
            }
        }
        drop(workers);
        let mut trackers = self.trackers.lock().await;
        for key in &keys {
            trackers.remove(key);
        }
        drop(trackers);
        self.store.purge_partition(partition_key).await
    }

    fn coerce_queue_spec(mut spec: QueueSpec) -> QueueSpec {
        if spec.backoff_multiplier <= 0.0 {
            spec.backoff_multiplier = 2.0;
        }
        spec
    }

    pub async fn upsert_queue(&self, spec: QueueSpec) -> Result<Queue> {
        self.store.upsert_queue(Self::coerce_queue_spec(spec)).await
    }

    /// Pause a queue: claimed-but-unfinished jobs keep running, but no
    /// `JobProcessor` cycle claims anything new from it until resumed.
    pub async fn pause(&self, name: &str, partition_key: &str) -> Result<()> {
        self.store.set_paused(name, partition_key, true).await
    }

    pub async fn resume(&self, name: &str, partition_key: &str) -> Result<()> {
        self.store.set_paused(name, partition_key, false).await
    }

    fn validate_payload_size(&self, job: &NewJob) -> Result<()> {
        let limit = self.options.max_payload_size_kb * 1024;
        let size = serde_json::to_vec(&job.payload)
            .map_err(|err| QueueError::Store(anyhow::anyhow!(err)))?
            .len();
        if size > limit {
            return Err(QueueError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    /// Enqueue `jobs` onto `(queue_name, partition_key)` after validating
    /// payload sizes. Dedup is silent (fewer ids come back than jobs were
    /// submitted); a missing queue is a hard error.
    pub async fn enqueue(&self, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        for job in &jobs {
            self.validate_payload_size(job)?;
        }
        self.store.add_jobs(queue_name, partition_key, jobs).await
    }

    /// Convenience overload that enqueues onto the facade's default
    /// partition.
    pub async fn enqueue_default(&self, queue_name: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let partition_key = self.options.partition_key.clone();
        self.enqueue(queue_name, &partition_key, jobs).await
    }

    /// Start `options.concurrency` workers against `queue_id` running
    /// `handler`. Workers are tracked under `(partition_key, queue_name)`
    /// so `purge`/`dispose` can stop them.
    pub async fn work(
        self: &Arc<Self>,
        queue: &Queue,
        handler: Handler,
        options: WorkOptions,
    ) -> Result<()> {
        let key = format!("{}\0{}", queue.partition_key, queue.name);
        let tracker = ExecutionTracker::new();
        let mut group = Vec::with_capacity(options.concurrency);
        for _ in 0..options.concurrency.max(1) {
            let mut processor = JobProcessor::new(
                self.store.clone(),
                queue.id,
                handler.clone(),
                options.processor,
                tracker.clone(),
            );
            if let Some(cb) = options.on_job_processed.clone() {
                processor = processor.on_job_processed(cb);
            }
            if let Some(cb) = options.on_job_failed.clone() {
                processor = processor.on_job_failed(cb);
            }
            let worker = Worker::start(Arc::new(processor), options.worker);
            group.push(worker);
        }
        self.workers.lock().await.insert(key.clone(), group);
        self.trackers.lock().await.insert(key, tracker);
        Ok(())
    }

    /// The execution tracker for every worker started against
    /// `(partition_key, queue_name)` through this facade, if any are
    /// running. Lets tests and graceful-shutdown callers await in-flight
    /// completion without touching the store.
    pub async fn execution_tracker(&self, partition_key: &str, queue_name: &str) -> Option<ExecutionTracker> {
        let key = format!("{partition_key}\0{queue_name}");
        self.trackers.lock().await.get(&key).cloned()
    }
}
