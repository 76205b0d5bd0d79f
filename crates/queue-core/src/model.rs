//! Entity types shared by every component: queues, jobs, leases, periodic
//! definitions and workflows. These are plain data - the `Store` trait is
//! what gives them persistence semantics.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A named, partitioned lane of jobs with its own retry and concurrency
/// policy. Unique on `(name, partition_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    pub partition_key: String,
    pub max_retries: i32,
    pub min_delay_ms: i64,
    pub backoff_multiplier: f64,
    pub max_duration_ms: i64,
    pub paused: bool,
    pub sequential: bool,
}

/// Fields a caller may set when creating or updating a queue. `paused` is
/// deliberately absent: an upsert must never reset a queue's pause state,
/// so pausing/resuming goes through `Store::set_paused` instead.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub partition_key: String,
    pub max_retries: i32,
    pub min_delay_ms: i64,
    pub backoff_multiplier: f64,
    pub max_duration_ms: i64,
    pub sequential: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            max_retries: 3,
            min_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_duration_ms: 5000,
            sequential: false,
        }
    }
}

/// Lifecycle status of a job row. Transitions are documented on [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One entry in a job's append-only `errors` history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub at: DateTime<Utc>,
    pub attempt: i32,
    pub error: Value,
}

/// A durable unit of work.
///
/// Transitions: `pending -> running` (claim), `running -> completed`
/// (finalize success), `running -> pending` (retry, `attempts` incremented,
/// fresh `start_after`), `running -> failed` (terminal, `attempts + 1 >=
/// max_retries`). `errors` only ever grows.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub running_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub errors: Vec<JobErrorEntry>,
    pub idempotent_key: Option<String>,
    pub pending_dedup_key: Option<String>,
    pub sequential_key: Option<String>,
}

/// The delivery order every `Store::claim_pending` implementation must
/// produce: oldest `created_at` first, then highest `priority` first, ties
/// broken by `id` ascending. Shared by `queue-mysql` (re-sorting rows after
/// the claim transaction) and `queue-testing` (sorting claim candidates
/// in-memory) so the two stores can never silently drift apart on ordering.
pub fn cmp_claim_order(a: &Job, b: &Job) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.id.cmp(&b.id))
}

/// Everything a producer supplies when enqueueing one job. `Facade` fills in
/// defaults before this reaches the `Store`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: Value,
    pub priority: i32,
    pub start_after: Option<DateTime<Utc>>,
    pub idempotent_key: Option<String>,
    pub pending_dedup_key: Option<String>,
    pub sequential_key: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: 0,
            start_after: None,
            idempotent_key: None,
            pending_dedup_key: None,
            sequential_key: None,
        }
    }
}

/// The retry policy a queue applies on failure; threaded into
/// `Store::fail_jobs` separately from the `Queue` row so callers that only
/// have policy numbers (the rescuer, after loading the queue once) don't
/// need to round-trip a full `Queue`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub min_delay_ms: i64,
    pub backoff_multiplier: f64,
}

impl From<&Queue> for RetryPolicy {
    fn from(q: &Queue) -> Self {
        Self {
            max_retries: q.max_retries,
            min_delay_ms: q.min_delay_ms,
            backoff_multiplier: q.backoff_multiplier,
        }
    }
}

/// Persisted state for a registered periodic job definition.
#[derive(Debug, Clone)]
pub struct PeriodicState {
    pub name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Active,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

/// A running (or finished) instance of a workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub definition_name: String,
    pub current_step: String,
    pub data: Value,
    pub step_results: serde_json::Map<String, Value>,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}
