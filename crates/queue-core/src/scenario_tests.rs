//! The concrete worked scenarios: backoff timing, dedup across states,
//! claim priority, parallel workflow convergence, repeated rescue, and
//! sequential-key exclusivity under concurrent workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use queue_testing::harness::wait_until;
use queue_testing::InMemoryStore;

use crate::cancel::CancelToken;
use crate::facade::{Facade, FacadeOptions, WorkOptions};
use crate::model::{Job, JobStatus, NewJob, QueueSpec, RetryPolicy, WorkflowStatus};
use crate::processor::{Handler, JobProcessor, ProcessorOptions};
use crate::rescuer::{Rescuer, RescuerOptions};
use crate::store::Store;
use crate::tracker::ExecutionTracker;
use crate::worker::WorkerOptions;
use crate::workflow::{StepResultFuture, WorkflowDefinition, WorkflowEngine, WorkflowStep};

fn fixture_job(queue_id: Uuid, name: &str, priority: i32, created_at: chrono::DateTime<Utc>) -> Job {
    Job {
        id: Uuid::new_v4(),
        queue_id,
        name: name.to_string(),
        payload: json!({}),
        priority,
        status: JobStatus::Pending,
        created_at,
        start_after: created_at,
        running_at: None,
        completed_at: None,
        failed_at: None,
        attempts: 0,
        errors: Vec::new(),
        idempotent_key: None,
        pending_dedup_key: None,
        sequential_key: None,
    }
}

fn no_op_step() -> crate::workflow::StepHandler {
    Arc::new(|_ctx, _input| -> StepResultFuture { Box::pin(async { Ok::<_, anyhow::Error>(json!({})) }) })
}

fn counting_step(counter: Arc<AtomicUsize>) -> crate::workflow::StepHandler {
    Arc::new(move |_ctx, _input| -> StepResultFuture {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(json!({}))
        })
    })
}

#[tokio::test]
async fn s1_backoff_timing_follows_exponential_schedule() {
    let store = Arc::new(InMemoryStore::new());
    let mut spec = QueueSpec::new("backoff", "default");
    spec.max_retries = 4;
    spec.min_delay_ms = 1000;
    spec.backoff_multiplier = 2.0;
    let queue = store.upsert_queue(spec).await.unwrap();

    let ids = store
        .add_jobs(&queue.name, &queue.partition_key, vec![NewJob::new("always-fails", json!({}))])
        .await
        .unwrap();
    let job_id = ids[0];
    let policy = RetryPolicy::from(&queue);
    let error = json!({"name": "Error", "message": "boom"});

    // Delays a queue with minDelayMs=1000, backoffMultiplier=2 schedules
    // before its 2nd, 3rd and 4th attempts, driven directly through
    // `fail_jobs` rather than real wall-clock sleeps.
    let expected_delays_ms = [1000i64, 2000, 4000];
    let mut previous_start_after = store.get_job(job_id).await.unwrap().start_after;
    for (attempt, expected_delay) in expected_delays_ms.iter().enumerate() {
        store.fail_jobs(&[job_id], policy, error.clone()).await.unwrap();
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending, "attempt {} should retry", attempt + 1);
        assert_eq!(job.attempts, attempt as i32 + 1);
        assert_eq!(job.errors.len(), attempt + 1);
        let observed_delay = (job.start_after - previous_start_after).num_milliseconds();
        assert!(
            (observed_delay - expected_delay).abs() <= 50,
            "attempt {} delay was {observed_delay}ms, expected ~{expected_delay}ms",
            attempt + 1
        );
        previous_start_after = job.start_after;
    }

    // The 4th failure reaches max_retries and terminates the job.
    store.fail_jobs(&[job_id], policy, error.clone()).await.unwrap();
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 4);
    assert_eq!(job.errors.len(), 4);
}

#[tokio::test]
async fn s2_dedup_collapses_live_rows_but_not_terminal_ones() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("dedup", "default")).await.unwrap();

    let mut job = NewJob::new("x", json!({}));
    job.pending_dedup_key = Some("k".to_string());
    let ids = store
        .add_jobs(&queue.name, &queue.partition_key, vec![job.clone(), job.clone()])
        .await
        .unwrap();
    assert_eq!(ids.len(), 1, "two enqueues sharing a live pendingDedupKey should collapse to one row");

    let job_id = ids[0];
    let claimed = store.claim_pending(queue.id, 10, false).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let affected = store.mark_completed(&[job_id]).await.unwrap();
    assert_eq!(affected, 1);

    let ids_after_completion = store.add_jobs(&queue.name, &queue.partition_key, vec![job]).await.unwrap();
    assert_eq!(ids_after_completion.len(), 1, "a fresh enqueue after the prior row went terminal must succeed");
    assert_ne!(ids_after_completion[0], job_id);

    let all = store.jobs_in_queue(queue.id).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|j| j.status == JobStatus::Completed).count(), 1);
    assert_eq!(all.iter().filter(|j| j.status == JobStatus::Pending).count(), 1);
}

#[tokio::test]
async fn s3_claim_orders_by_priority_within_the_same_instant() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("priority", "default")).await.unwrap();
    let now = Utc::now();
    for (name, priority) in [("priority-1", 1), ("priority-2", 2), ("priority-3", 3)] {
        store.insert_job_fixture(fixture_job(queue.id, name, priority, now)).await;
    }

    let claimed = store.claim_pending(queue.id, 10, false).await.unwrap();
    let names: Vec<&str> = claimed.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["priority-3", "priority-2", "priority-1"]);
}

#[tokio::test]
async fn s4_parallel_steps_converge_into_end_exactly_once() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let facade = Facade::new(store, FacadeOptions::default());
    facade.upsert_queue(QueueSpec::new("workflow-queue", "default")).await.unwrap();

    let end_calls = Arc::new(AtomicUsize::new(0));

    let start = WorkflowStep::new("start", no_op_step()).next_many(vec!["a".to_string(), "b".to_string()]);
    let a = WorkflowStep::new("a", no_op_step()).next_to("end");
    let b = WorkflowStep::new("b", no_op_step()).next_to("end");
    let end = WorkflowStep::new("end", counting_step(end_calls.clone()));

    let definition = WorkflowDefinition::new("diamond", "start", "workflow-queue")
        .with_step(start)
        .with_step(a)
        .with_step(b)
        .with_step(end);

    let engine = WorkflowEngine::new(facade.clone(), vec![definition]);
    let workflow = engine.start("diamond", json!({"trace": "s4"})).await.unwrap();

    let queue = facade.store().get_queue("workflow-queue", "default").await.unwrap().unwrap();
    let options = WorkOptions {
        worker: WorkerOptions { polling_interval_ms: 5 },
        processor: ProcessorOptions {
            polling_batch_size: 4,
            callback_batch_size: 1,
        },
        concurrency: 2,
        on_job_processed: None,
        on_job_failed: None,
    };
    facade.work(&queue, engine.handler(), options).await.unwrap();

    let workflow_id = workflow.id;
    let finished = wait_until(Duration::from_secs(2), Duration::from_millis(5), || {
        let store = facade.store();
        async move {
            matches!(
                store.get_workflow(workflow_id).await.unwrap().map(|w| w.status),
                Some(WorkflowStatus::Completed)
            )
        }
    })
    .await;
    assert!(finished, "workflow did not converge in time");

    facade.dispose().await;

    assert_eq!(end_calls.load(Ordering::SeqCst), 1, "end must run exactly once despite two parallel predecessors");
    let workflow = facade.store().get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.completed_steps.len(), 4);
    for step in ["start", "a", "b", "end"] {
        assert!(workflow.completed_steps.contains(&step.to_string()), "missing completed step {step}");
    }
}

#[tokio::test]
async fn s5_repeated_rescue_retries_then_fails_terminally() {
    let store = Arc::new(InMemoryStore::new());
    let mut spec = QueueSpec::new("rescue-repeat", "default");
    spec.max_retries = 2;
    let queue = store.upsert_queue(spec).await.unwrap();
    let ids = store
        .add_jobs(&queue.name, &queue.partition_key, vec![NewJob::new("stuck", json!({}))])
        .await
        .unwrap();
    let job_id = ids[0];

    let store_dyn: Arc<dyn Store> = store.clone();
    let rescuer = Rescuer::new(
        store_dyn,
        RescuerOptions {
            rescue_after_ms: 3_600_000,
            ..RescuerOptions::default()
        },
    );
    let stale_running_at = Utc::now() - chrono::Duration::milliseconds(40_000_000);

    // First rescue: attempts 0 -> 1, a terminally-failed job must never
    // exceed max_retries, so with max_retries=2 the terminal transition
    // lands on the second rescue rather than the third.
    store.force_running(job_id, stale_running_at).await;
    rescuer.run_once().await.unwrap();
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].error["name"], "RescuerError");

    // Second rescue: attempts 1 -> 2, terminal.
    store.force_running(job_id, stale_running_at).await;
    rescuer.run_once().await.unwrap();
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.errors.len(), 2);
    for entry in &job.errors {
        assert_eq!(entry.error["name"], "RescuerError");
    }
}

type Intervals = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

fn interval_recording_handler(intervals: Intervals, work_ms: u64) -> Handler {
    Arc::new(move |jobs, _cancel, _ctx| {
        let intervals = intervals.clone();
        Box::pin(async move {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(work_ms)).await;
            let end = Instant::now();
            let mut guard = intervals.lock().await;
            for job in &jobs {
                guard.push((job.sequential_key.clone().unwrap_or_default(), start, end));
            }
            Ok(())
        })
    })
}

fn intervals_overlap(a: (Instant, Instant), b: (Instant, Instant)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

#[tokio::test]
async fn s6_sequential_keyed_jobs_never_overlap_while_unkeyed_jobs_may() {
    let store = Arc::new(InMemoryStore::new());
    let mut spec = QueueSpec::new("sequential", "default");
    spec.sequential = true;
    let queue = store.upsert_queue(spec).await.unwrap();

    let mut seeded = Vec::new();
    for i in 0..3 {
        let mut job = NewJob::new("keyed", json!({"i": i}));
        job.sequential_key = Some("u:1".to_string());
        seeded.push(job);
    }
    for i in 0..2 {
        seeded.push(NewJob::new("unkeyed", json!({"i": i})));
    }
    let ids = store.add_jobs(&queue.name, &queue.partition_key, seeded).await.unwrap();
    assert_eq!(ids.len(), 5);

    let intervals: Intervals = Arc::new(Mutex::new(Vec::new()));
    let handler = interval_recording_handler(intervals.clone(), 30);

    let store_dyn: Arc<dyn Store> = store.clone();
    let processor = Arc::new(JobProcessor::new(
        store_dyn,
        queue.id,
        handler,
        ProcessorOptions::default(),
        ExecutionTracker::new(),
    ));
    let token = CancelToken::new();

    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds <= 50, "jobs did not drain within a bounded number of concurrent rounds");

        let mut set: JoinSet<bool> = JoinSet::new();
        for _ in 0..2 {
            let processor = processor.clone();
            let token = token.clone();
            set.spawn(async move { processor.run_once(&token).await.unwrap() });
        }
        let mut any_progress = false;
        while let Some(res) = set.join_next().await {
            any_progress |= res.unwrap();
        }

        let mut remaining = 0;
        for id in &ids {
            if store.get_job(*id).await.unwrap().status != JobStatus::Completed {
                remaining += 1;
            }
        }
        if remaining == 0 {
            break;
        }
        if !any_progress {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let guard = intervals.lock().await;
    let keyed: Vec<(Instant, Instant)> = guard
        .iter()
        .filter(|(key, _, _)| key == "u:1")
        .map(|(_, start, end)| (*start, *end))
        .collect();
    assert_eq!(keyed.len(), 3);
    for i in 0..keyed.len() {
        for j in (i + 1)..keyed.len() {
            assert!(
                !intervals_overlap(keyed[i], keyed[j]),
                "sequential-key jobs overlapped: {:?} vs {:?}",
                keyed[i],
                keyed[j]
            );
        }
    }
}
