//! The claim -> execute-with-timeout -> finalize cycle. One `JobProcessor`
//! drives one queue; `Worker` wraps it in a polling loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cancel::{with_timeout, CancelToken};
use crate::error::{QueueError, Result};
use crate::model::{Job, Queue, RetryPolicy};
use crate::store::Store;
use crate::tracker::ExecutionTracker;

/// Handle passed to a job callback. Exposes the "commit completion inside my
/// own transaction" escape hatch the workflow engine and other
/// session-using handlers need.
#[derive(Clone)]
pub struct JobContext {
    store: Arc<dyn Store>,
    self_completed: Arc<AtomicBool>,
}

impl JobContext {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            self_completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark `job_ids` completed right now, as part of the callback's own
    /// work, instead of waiting for the processor's finalize step. Calling
    /// this means the processor will not mark the chunk completed again.
    ///
    /// Errors if fewer rows were affected than requested - those jobs left
    /// `running` out from under the caller (most likely reclaimed by the
    /// rescuer) and the caller's writes should be treated as lost.
    pub async fn mark_jobs_as_completed(&self, job_ids: &[Uuid]) -> Result<()> {
        let affected = self.store.mark_completed(job_ids).await?;
        if affected as usize != job_ids.len() {
            return Err(QueueError::CompletionRaced {
                requested: job_ids.len(),
                affected: affected as usize,
            });
        }
        self.self_completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Same as [`JobContext::mark_jobs_as_completed`], but the completion
    /// is folded into a session the caller already used to write other
    /// state (e.g. the workflow engine's state advance and successor
    /// enqueue) so everything commits atomically together.
    pub async fn complete_via_session(
        &self,
        session: Box<dyn crate::store::StoreSession>,
        job_ids: &[Uuid],
    ) -> Result<()> {
        let affected = session.mark_completed(job_ids).await?;
        session.commit().await?;
        if affected as usize != job_ids.len() {
            return Err(QueueError::CompletionRaced {
                requested: job_ids.len(),
                affected: affected as usize,
            });
        }
        self.self_completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn did_self_complete(&self) -> bool {
        self.self_completed.load(Ordering::SeqCst)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registered job callback: given the claimed chunk, a cancel token scoped
/// to that chunk, and a context, do the work.
pub type Handler = Arc<dyn Fn(Vec<Job>, CancelToken, JobContext) -> HandlerFuture + Send + Sync>;

/// Fired once per job after finalize, regardless of outcome.
pub type OnJobProcessed = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Fired once per job the moment its attempt count reaches `maxRetries` and
/// it is finalized as terminally failed.
pub type OnJobFailed = Arc<dyn Fn(Uuid, &str, &Value) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    pub polling_batch_size: i64,
    pub callback_batch_size: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            polling_batch_size: 1,
            callback_batch_size: 1,
        }
    }
}

pub struct JobProcessor {
    store: Arc<dyn Store>,
    queue_id: Uuid,
    handler: Handler,
    options: ProcessorOptions,
    on_job_processed: Option<OnJobProcessed>,
    on_job_failed: Option<OnJobFailed>,
    tracker: ExecutionTracker,
}

enum ChunkOutcome {
    Completed(Vec<Uuid>),
    SelfCompleted,
    Failed { jobs: Vec<Job>, error: Value },
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        queue_id: Uuid,
        handler: Handler,
        options: ProcessorOptions,
        tracker: ExecutionTracker,
    ) -> Self {
        Self {
            store,
            queue_id,
            handler,
            options,
            on_job_processed: None,
            on_job_failed: None,
            tracker,
        }
    }

    pub fn on_job_processed(mut self, f: OnJobProcessed) -> Self {
        self.on_job_processed = Some(f);
        self
    }

    pub fn on_job_failed(mut self, f: OnJobFailed) -> Self {
        self.on_job_failed = Some(f);
        self
    }

    /// The tracker this processor marks jobs in-flight against, from the
    /// moment they're claimed until this cycle's finalize step completes.
    pub fn execution_tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Run one cycle: claim, execute, finalize. Returns `false` when there
    /// was nothing to claim (a paused queue counts as nothing to claim).
    pub async fn run_once(&self, parent: &CancelToken) -> Result<bool> {
        if parent.is_cancelled() {
            return Ok(false);
        }

        let queue = match self.store.get_queue_by_id(self.queue_id).await? {
            Some(q) => q,
            None => return Err(QueueError::QueueNotFound(self.queue_id)),
        };
        if queue.paused {
            return Ok(false);
        }

        let claimed = self
            .store
            .claim_pending(queue.id, self.options.polling_batch_size, queue.sequential)
            .await?;
        if claimed.is_empty() {
            return Ok(false);
        }
        tracing::debug!(queue = %queue.name, count = claimed.len(), "claimed jobs");

        // Tracked from claim until this cycle's finalize step completes
        // (dropped at the end of this function), so `wait_idle` on the
        // facade's tracker reflects exactly the jobs currently owned by a
        // worker.
        let _in_flight: Vec<_> = claimed.iter().map(|j| self.tracker.track(j.id)).collect();

        let chunks: Vec<Vec<Job>> = claimed
            .chunks(self.options.callback_batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        let mut set: JoinSet<ChunkOutcome> = JoinSet::new();
        for chunk in chunks {
            let handler = self.handler.clone();
            let chunk_token = parent.child();
            let ctx = JobContext::new(self.store.clone());
            let max_duration = Duration::from_millis(queue.max_duration_ms.max(0) as u64);
            set.spawn(Self::run_chunk(chunk, handler, chunk_token, ctx, max_duration));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "chunk task panicked");
                }
            }
        }

        self.finalize(&queue, outcomes).await?;
        Ok(true)
    }

    async fn run_chunk(
        chunk: Vec<Job>,
        handler: Handler,
        token: CancelToken,
        ctx: JobContext,
        max_duration: Duration,
    ) -> ChunkOutcome {
        let job_ids: Vec<Uuid> = chunk.iter().map(|j| j.id).collect();
        let jobs_for_failure = chunk.clone();
        let ctx_for_handler = ctx.clone();
        let token_for_handler = token.clone();
        let result = with_timeout(max_duration, &token, async move {
            handler(chunk, token_for_handler, ctx_for_handler).await
        })
        .await;

        if ctx.did_self_complete() {
            return ChunkOutcome::SelfCompleted;
        }

        match result {
            Some(Ok(())) => ChunkOutcome::Completed(job_ids),
            Some(Err(err)) => ChunkOutcome::Failed {
                jobs: jobs_for_failure,
                error: json!({ "name": "Error", "message": err.to_string() }),
            },
            None => {
                let timeout = QueueError::Timeout {
                    max_duration_ms: max_duration.as_millis() as i64,
                };
                ChunkOutcome::Failed {
                    jobs: jobs_for_failure,
                    error: json!({ "name": "TimeoutError", "message": timeout.to_string() }),
                }
            }
        }
    }

    async fn finalize(&self, queue: &Queue, outcomes: Vec<ChunkOutcome>) -> Result<()> {
        let mut to_complete = Vec::new();
        let mut to_fail: Vec<(Vec<Job>, Value)> = Vec::new();

        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Completed(ids) => to_complete.extend(ids),
                ChunkOutcome::SelfCompleted => {}
                ChunkOutcome::Failed { jobs, error } => to_fail.push((jobs, error)),
            }
        }

        if !to_complete.is_empty() {
            let affected = self.store.mark_completed(&to_complete).await?;
            if affected as usize != to_complete.len() {
                tracing::warn!(
                    requested = to_complete.len(),
                    affected,
                    "some completed jobs had already left running - likely rescued"
                );
            }
            if let Some(cb) = &self.on_job_processed {
                for id in &to_complete {
                    cb(*id);
                }
            }
        }

        let policy = RetryPolicy::from(queue);
        for (jobs, error) in to_fail {
            let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
            self.store.fail_jobs(&job_ids, policy, error.clone()).await?;
            if let Some(cb) = &self.on_job_processed {
                for id in &job_ids {
                    cb(*id);
                }
            }
            if let Some(cb) = &self.on_job_failed {
                for job in &jobs {
                    // claim_pending only ever hands out jobs with
                    // attempts < maxRetries, so attempts+1 reaching
                    // maxRetries here means this failure was terminal.
                    if job.attempts + 1 >= queue.max_retries {
                        cb(job.id, queue.name.as_str(), &error);
                    }
                }
            }
        }

        Ok(())
    }
}
