//! An in-memory `Store` implementation mirroring every dedup, sequential-key
//! and retry invariant the real MySQL store enforces, so `queue-core`'s own
//! test suite (and consumers') can exercise the engine without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::error::{QueueError, Result};
use queue_core::model::{
    cmp_claim_order, Job, JobErrorEntry, JobStatus, NewJob, PeriodicState, Queue, QueueSpec, RetryPolicy, Workflow,
    WorkflowStatus,
};
use queue_core::store::{Store, StoreSession};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Lease {
    leader_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
struct Inner {
    queues: HashMap<Uuid, Queue>,
    queue_index: HashMap<(String, String), Uuid>,
    jobs: HashMap<Uuid, Job>,
    periodic: HashMap<String, PeriodicState>,
    leases: HashMap<String, Lease>,
    workflows: HashMap<Uuid, Workflow>,
}

/// An in-memory, process-local `Store`. Not durable, not shared across
/// processes - exists purely to run `queue-core`'s behavioral tests and to
/// let downstream crates test their job handlers without MySQL.
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Test-only direct lookup, bypassing the `Store` trait (which has no
    /// "get job by id" - production code never needs one, only assertions
    /// do).
    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    /// Test-only: every job currently in `queue_id`, unordered.
    pub async fn jobs_in_queue(&self, queue_id: Uuid) -> Vec<Job> {
        self.inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.queue_id == queue_id)
            .cloned()
            .collect()
    }

    /// Test-only: force a job directly into `running` with a caller-chosen
    /// `running_at`, bypassing `claim_pending`. Used to simulate a worker
    /// that died mid-job without waiting out a real stuck horizon.
    pub async fn force_running(&self, id: Uuid, running_at: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().await.jobs.get_mut(&id) {
            job.status = JobStatus::Running;
            job.running_at = Some(running_at);
        }
    }

    /// Test-only: insert a fully-formed job row directly, bypassing
    /// `add_jobs` and its dedup checks. Used by ordering/sequential-key
    /// tests that need exact control over `created_at` - real enqueues
    /// stamp it from the wall clock, which is too coarse to pin an
    /// ordering assertion to.
    pub async fn insert_job_fixture(&self, job: Job) {
        self.inner.lock().await.jobs.insert(job.id, job);
    }
}

fn resolve_queue(inner: &Inner, name: &str, partition_key: &str) -> Option<Queue> {
    inner
        .queue_index
        .get(&(name.to_string(), partition_key.to_string()))
        .and_then(|id| inner.queues.get(id))
        .cloned()
}

fn idempotent_conflict(inner: &Inner, queue_id: Uuid, name: &str, key: &str) -> bool {
    inner
        .jobs
        .values()
        .any(|j| j.queue_id == queue_id && j.name == name && j.idempotent_key.as_deref() == Some(key))
}

fn pending_dedup_conflict(inner: &Inner, queue_id: Uuid, name: &str, key: &str) -> bool {
    inner.jobs.values().any(|j| {
        j.queue_id == queue_id
            && j.name == name
            && j.pending_dedup_key.as_deref() == Some(key)
            && matches!(j.status, JobStatus::Pending | JobStatus::Running)
    })
}

fn add_jobs_inner(inner: &mut Inner, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
    let queue = resolve_queue(inner, queue_name, partition_key).ok_or_else(|| QueueError::QueueMissing {
        name: queue_name.to_string(),
        partition_key: partition_key.to_string(),
    })?;

    let mut inserted = Vec::with_capacity(jobs.len());
    for new_job in jobs {
        if let Some(key) = &new_job.idempotent_key {
            if idempotent_conflict(inner, queue.id, &new_job.name, key) {
                continue;
            }
        }
        if let Some(key) = &new_job.pending_dedup_key {
            if pending_dedup_conflict(inner, queue.id, &new_job.name, key) {
                continue;
            }
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = Job {
            id,
            queue_id: queue.id,
            name: new_job.name,
            payload: new_job.payload,
            priority: new_job.priority,
            status: JobStatus::Pending,
            created_at: now,
            start_after: new_job.start_after.unwrap_or(now),
            running_at: None,
            completed_at: None,
            failed_at: None,
            attempts: 0,
            errors: Vec::new(),
            idempotent_key: new_job.idempotent_key,
            pending_dedup_key: new_job.pending_dedup_key,
            sequential_key: new_job.sequential_key,
        };
        inner.jobs.insert(id, job);
        inserted.push(id);
    }
    Ok(inserted)
}

fn claim_pending_inner(inner: &mut Inner, queue_id: Uuid, limit: i64, sequential: bool) -> Vec<Job> {
    let now = Utc::now();
    let mut candidates: Vec<Uuid> = inner
        .jobs
        .values()
        .filter(|j| j.queue_id == queue_id && j.status == JobStatus::Pending && j.start_after <= now)
        .map(|j| j.id)
        .collect();

    candidates.sort_by(|a, b| cmp_claim_order(&inner.jobs[a], &inner.jobs[b]));

    let mut claimed = Vec::new();
    for id in candidates {
        if claimed.len() as i64 >= limit.max(0) {
            break;
        }
        let job = &inner.jobs[&id];
        if sequential {
            if let Some(key) = job.sequential_key.clone() {
                let blocked = inner.jobs.values().any(|other| {
                    other.id != id
                        && other.queue_id == queue_id
                        && other.sequential_key.as_deref() == Some(key.as_str())
                        && (other.status == JobStatus::Running
                            || (other.status == JobStatus::Pending && other.created_at < job.created_at))
                });
                if blocked {
                    continue;
                }
            }
        }
        claimed.push(id);
    }

    for id in &claimed {
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = JobStatus::Running;
            job.running_at = Some(now);
        }
    }
    claimed.into_iter().map(|id| inner.jobs[&id].clone()).collect()
}

fn mark_completed_inner(inner: &mut Inner, job_ids: &[Uuid]) -> u64 {
    let mut affected = 0;
    let now = Utc::now();
    for id in job_ids {
        if let Some(job) = inner.jobs.get_mut(id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Completed;
                job.attempts += 1;
                job.completed_at = Some(now);
                affected += 1;
            }
        }
    }
    affected
}

fn fail_jobs_inner(inner: &mut Inner, job_ids: &[Uuid], policy: RetryPolicy, error: Value) {
    let now = Utc::now();
    for id in job_ids {
        if let Some(job) = inner.jobs.get_mut(id) {
            let next_attempt = job.attempts + 1;
            job.errors.push(JobErrorEntry {
                at: now,
                attempt: next_attempt,
                error: error.clone(),
            });
            if next_attempt < policy.max_retries {
                // Terminal iff this attempt reaches max_retries - compare
                // the post-increment count against the limit, not the
                // pre-increment one, so a terminally-failed job always has
                // attempts <= max_retries. `job.attempts` in the exponent
                // below is still the pre-increment count: the Nth failure
                // (N starting at 1) applies exponent N-1, so the first
                // retry always waits exactly `min_delay_ms`.
                let delay_ms = (policy.min_delay_ms as f64) * policy.backoff_multiplier.powi(job.attempts);
                let delay_ms = delay_ms.round() as i64;
                job.status = JobStatus::Pending;
                job.start_after = now + chrono::Duration::milliseconds(delay_ms.max(0));
                job.running_at = None;
                job.attempts = next_attempt;
            } else {
                job.status = JobStatus::Failed;
                job.failed_at = Some(now);
                job.attempts = next_attempt;
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn run_migrations(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_queue(&self, spec: QueueSpec) -> Result<Queue> {
        let mut inner = self.inner.lock().await;
        let key = (spec.name.clone(), spec.partition_key.clone());
        if let Some(id) = inner.queue_index.get(&key).copied() {
            let queue = inner.queues.get_mut(&id).expect("queue index out of sync");
            queue.max_retries = spec.max_retries;
            queue.min_delay_ms = spec.min_delay_ms;
            queue.backoff_multiplier = spec.backoff_multiplier;
            queue.max_duration_ms = spec.max_duration_ms;
            queue.sequential = spec.sequential;
            return Ok(queue.clone());
        }
        let id = Uuid::new_v4();
        let queue = Queue {
            id,
            name: spec.name.clone(),
            partition_key: spec.partition_key.clone(),
            max_retries: spec.max_retries,
            min_delay_ms: spec.min_delay_ms,
            backoff_multiplier: spec.backoff_multiplier,
            max_duration_ms: spec.max_duration_ms,
            paused: false,
            sequential: spec.sequential,
        };
        inner.queue_index.insert(key, id);
        inner.queues.insert(id, queue.clone());
        Ok(queue)
    }

    async fn get_queue(&self, name: &str, partition_key: &str) -> Result<Option<Queue>> {
        let inner = self.inner.lock().await;
        Ok(resolve_queue(&inner, name, partition_key))
    }

    async fn get_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(&id).cloned())
    }

    async fn set_paused(&self, name: &str, partition_key: &str, paused: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.queue_index.get(&(name.to_string(), partition_key.to_string())).copied() {
            if let Some(queue) = inner.queues.get_mut(&id) {
                queue.paused = paused;
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str, partition_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = (name.to_string(), partition_key.to_string());
        if let Some(id) = inner.queue_index.remove(&key) {
            inner.queues.remove(&id);
            inner.jobs.retain(|_, j| j.queue_id != id);
        }
        Ok(())
    }

    async fn purge_partition(&self, partition_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<Uuid> = inner
            .queues
            .values()
            .filter(|q| q.partition_key == partition_key)
            .map(|q| q.id)
            .collect();
        inner.queue_index.retain(|_, id| !ids.contains(id));
        inner.queues.retain(|id, _| !ids.contains(id));
        inner.jobs.retain(|_, j| !ids.contains(&j.queue_id));
        Ok(())
    }

    async fn add_jobs(&self, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        add_jobs_inner(&mut inner, queue_name, partition_key, jobs)
    }

    async fn claim_pending(&self, queue_id: Uuid, limit: i64, sequential: bool) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        Ok(claim_pending_inner(&mut inner, queue_id, limit, sequential))
    }

    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(mark_completed_inner(&mut inner, job_ids))
    }

    async fn fail_jobs(&self, job_ids: &[Uuid], policy: RetryPolicy, error: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        fail_jobs_inner(&mut inner, job_ids, policy, error);
        Ok(())
    }

    async fn pending_jobs_stuck(&self, horizon: Duration, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(horizon).unwrap_or_default();
        let mut stuck: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.running_at.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.running_at);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn try_acquire_leadership(&self, singleton_key: &str, instance_id: &str, lease_ms: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(lease_ms);
        let eligible = match inner.leases.get(singleton_key) {
            None => true,
            Some(lease) => lease.expires_at < now || lease.leader_id == instance_id,
        };
        if eligible {
            inner.leases.insert(
                singleton_key.to_string(),
                Lease {
                    leader_id: instance_id.to_string(),
                    expires_at,
                },
            );
        }
        Ok(eligible)
    }

    async fn renew_leadership(&self, singleton_key: &str, instance_id: &str, lease_ms: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get_mut(singleton_key) {
            Some(lease) if lease.leader_id == instance_id => {
                lease.expires_at = Utc::now() + chrono::Duration::milliseconds(lease_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_leadership(&self, singleton_key: &str, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(lease) = inner.leases.get(singleton_key) {
            if lease.leader_id == instance_id {
                inner.leases.remove(singleton_key);
            }
        }
        Ok(())
    }

    async fn get_periodic_state(&self, name: &str) -> Result<Option<PeriodicState>> {
        let inner = self.inner.lock().await;
        Ok(inner.periodic.get(name).cloned())
    }

    async fn upsert_periodic_state(
        &self,
        name: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.periodic.insert(
            name.to_string(),
            PeriodicState {
                name: name.to_string(),
                last_run_at,
                next_run_at,
            },
        );
        Ok(())
    }

    async fn delete_periodic_state(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.periodic.remove(name);
        Ok(())
    }

    async fn start_workflow(
        &self,
        definition_name: &str,
        start_step: &str,
        data: Value,
        workflow_queue_name: &str,
        partition_key: &str,
    ) -> Result<Workflow> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let workflow = Workflow {
            id,
            definition_name: definition_name.to_string(),
            current_step: start_step.to_string(),
            data: data.clone(),
            step_results: serde_json::Map::new(),
            completed_steps: Vec::new(),
            pending_steps: vec![start_step.to_string()],
            status: WorkflowStatus::Active,
            created_at: now,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
        };
        inner.workflows.insert(id, workflow.clone());

        let mut job = NewJob::new(
            "workflow-step",
            json!({
                "workflowId": id,
                "context": data,
                "step": { "name": start_step },
            }),
        );
        job.pending_dedup_key = Some(format!("{id}:{start_step}"));
        add_jobs_inner(&mut inner, workflow_queue_name, partition_key, vec![job])?;
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let inner = self.inner.lock().await;
        Ok(inner.workflows.get(&id).cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn begin_session(&self) -> Result<Box<dyn StoreSession>> {
        let guard = self.inner.clone().lock_owned().await;
        Ok(Box::new(InMemorySession::new(guard)))
    }

    async fn drop_all_tables(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
        Ok(())
    }
}

/// A session over [`InMemoryStore`]: writes land in a private copy of the
/// store's state and are only written back on `commit`, while the real
/// store's lock stays held for the session's whole lifetime so no other
/// caller can interleave.
struct InMemorySession {
    guard: OwnedMutexGuard<Inner>,
    working: std::sync::Mutex<Inner>,
}

impl InMemorySession {
    fn new(guard: OwnedMutexGuard<Inner>) -> Self {
        let working = std::sync::Mutex::new(guard.clone());
        Self { guard, working }
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64> {
        let mut inner = self.working.lock().expect("session mutex poisoned");
        Ok(mark_completed_inner(&mut inner, job_ids))
    }

    async fn add_jobs(&self, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let mut inner = self.working.lock().expect("session mutex poisoned");
        add_jobs_inner(&mut inner, queue_name, partition_key, jobs)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let inner = self.working.lock().expect("session mutex poisoned");
        Ok(inner.workflows.get(&id).cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.working.lock().expect("session mutex poisoned");
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut guard = self.guard;
        let working = self.working.into_inner().expect("session mutex poisoned");
        *guard = working;
        Ok(())
    }
}
