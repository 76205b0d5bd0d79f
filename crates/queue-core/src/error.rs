//! Structured error taxonomy for the queue engine.
//!
//! Splits between a pattern-matchable error enum and `anyhow::Error` as
//! internal transport: `QueueError` is what crosses component boundaries
//! and what callers match on; handler (callback) failures stay
//! `anyhow::Error` until they're captured into a job's `errors` history as
//! JSON.

use thiserror::Error;

/// Errors raised by the engine itself, as opposed to errors raised by a
/// user-supplied job callback (those are captured as JSON and routed
/// through the retry state machine instead of propagating here).
#[derive(Debug, Error)]
pub enum QueueError {
    /// `addJobs` could not resolve `(name, partition_key)` to a queue row.
    #[error("queue {name:?} in partition {partition_key:?} does not exist")]
    QueueMissing {
        name: String,
        partition_key: String,
    },

    /// Enqueued payload serializes larger than the configured limit.
    #[error("payload of {size} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A chunk's callback did not finish within the queue's
    /// `max_duration_ms`. The message intentionally matches the fixed
    /// prefix every finalize path checks for.
    #[error("Job execution exceed the timeout of {max_duration_ms}")]
    Timeout { max_duration_ms: i64 },

    /// `ctx.mark_jobs_as_completed` was called but the affected row count
    /// was less than the number of jobs requested - the rows were no
    /// longer `running` (most likely reclaimed by the rescuer).
    #[error("expected to complete {requested} jobs but only {affected} were still running")]
    CompletionRaced { requested: usize, affected: usize },

    /// A queue row referenced by id could not be found (e.g. deleted
    /// between claim and finalize).
    #[error("queue {0} not found")]
    QueueNotFound(uuid::Uuid),

    /// A workflow id referenced by a step job could not be found.
    #[error("workflow {0} not found")]
    WorkflowNotFound(uuid::Uuid),

    /// A workflow step name is not part of its definition.
    #[error("step {step:?} not found in workflow definition {definition:?}")]
    StepNotFound { definition: String, step: String },

    /// Connection/timeout/protocol errors from the underlying store,
    /// surfaced verbatim. Not retried at this layer.
    #[error("store operation failed: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
