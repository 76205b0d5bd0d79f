//! The `Store` trait: a typed data-access layer exposing every query and
//! transaction the engine needs, hiding dialect details behind strongly
//! typed entity records. The engine depends only on this trait, never on a
//! concrete database crate.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Job, NewJob, PeriodicState, Queue, QueueSpec, RetryPolicy, Workflow};

/// A transactional handle for operations that must commute with a workflow
/// step's own finalize transaction (`ctx.mark_jobs_as_completed`) or with a
/// workflow's own state update (enqueueing successor steps). Dropping a
/// session without calling `commit` discards its writes.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Mark jobs completed as part of this session's transaction.
    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64>;

    /// Enqueue jobs as part of this session's transaction. Same dedup
    /// semantics as [`Store::add_jobs`].
    async fn add_jobs(
        &self,
        queue_name: &str,
        partition_key: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Uuid>>;

    /// Read a workflow's current row as part of this session, locked so it
    /// cannot change out from under the session before `save_workflow`
    /// commits. Parallel steps converging on the same workflow must reload
    /// through this method rather than trust a snapshot read before the
    /// session was opened.
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>>;

    /// Persist a workflow's updated state as part of this session.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Commit every write buffered in this session.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Typed data-access layer. One implementation per database dialect; the
/// rest of the engine is written entirely against this trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply outstanding migrations under a process-wide advisory lock
    /// keyed by the table prefix. A losing instance returns `Ok(())`
    /// immediately - idempotent, safe to call from every process on boot.
    async fn run_migrations(&self) -> Result<()>;

    /// Create or update a queue. Must never reset `paused` - use
    /// [`Store::set_paused`] for that.
    async fn upsert_queue(&self, spec: QueueSpec) -> Result<Queue>;

    async fn get_queue(&self, name: &str, partition_key: &str) -> Result<Option<Queue>>;

    async fn get_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>>;

    async fn set_paused(&self, name: &str, partition_key: &str, paused: bool) -> Result<()>;

    /// Delete a queue; cascades to delete all of its jobs.
    async fn delete_queue(&self, name: &str, partition_key: &str) -> Result<()>;

    /// Delete every queue (and, by cascade, every job) in a partition.
    async fn purge_partition(&self, partition_key: &str) -> Result<()>;

    /// Atomically resolve `(queue_name, partition_key)` and insert `jobs`.
    /// Rows whose idempotent/pending-dedup unique index already has a
    /// match are silently skipped (dedup, not an error); the returned
    /// vector lists only the ids that were actually inserted. If the
    /// queue itself cannot be resolved, returns
    /// [`crate::error::QueueError::QueueMissing`].
    async fn add_jobs(
        &self,
        queue_name: &str,
        partition_key: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Uuid>>;

    /// Claim up to `limit` pending, due jobs from `queue_id`, transitioning
    /// them to `running` in the same transaction. Delivery order is
    /// `created_at ASC, priority DESC, id ASC`. When `sequential` is true,
    /// a job is only claimable once every earlier job sharing its
    /// `sequential_key` has left `running`.
    async fn claim_pending(&self, queue_id: Uuid, limit: i64, sequential: bool) -> Result<Vec<Job>>;

    /// Mark jobs completed. Returns the number of rows actually affected
    /// (still `running`); a caller that requested N and got back M < N has
    /// lost some jobs to the rescuer and should not treat this as fatal.
    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64>;

    /// Apply the retry/terminal-fail state machine to `job_ids` with a
    /// single error payload appended to each. Not atomic across ids in the
    /// sense of "all or nothing" - each row is evaluated independently
    /// against its own `attempts`.
    async fn fail_jobs(&self, job_ids: &[Uuid], policy: RetryPolicy, error: Value) -> Result<()>;

    /// Jobs stuck in `running` with `running_at` older than `horizon`,
    /// oldest first, capped at `limit`.
    async fn pending_jobs_stuck(&self, horizon: Duration, limit: i64) -> Result<Vec<Job>>;

    /// Attempt to become leader for `singleton_key`. Succeeds if no lease
    /// exists, the existing lease has expired, or `instance_id` already
    /// holds it (renew-as-acquire).
    async fn try_acquire_leadership(
        &self,
        singleton_key: &str,
        instance_id: &str,
        lease_ms: i64,
    ) -> Result<bool>;

    /// Extend the lease for `instance_id`. Returns `false` (lease lost,
    /// held by someone else or gone) without error.
    async fn renew_leadership(
        &self,
        singleton_key: &str,
        instance_id: &str,
        lease_ms: i64,
    ) -> Result<bool>;

    /// Best-effort release; only deletes the row if `instance_id` still
    /// holds it.
    async fn release_leadership(&self, singleton_key: &str, instance_id: &str) -> Result<()>;

    async fn get_periodic_state(&self, name: &str) -> Result<Option<PeriodicState>>;

    async fn upsert_periodic_state(
        &self,
        name: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_periodic_state(&self, name: &str) -> Result<()>;

    /// Create a workflow row and enqueue its start-step job in one
    /// transaction.
    async fn start_workflow(
        &self,
        definition_name: &str,
        start_step: &str,
        data: Value,
        workflow_queue_name: &str,
        partition_key: &str,
    ) -> Result<Workflow>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>>;

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Open a session whose writes commit together or not at all.
    async fn begin_session(&self) -> Result<Box<dyn StoreSession>>;

    /// Drop every table this store owns, in reverse-migration order. Used
    /// only by `Facade::global_destroy` in tests/throwaway environments.
    async fn drop_all_tables(&self) -> Result<()>;
}
