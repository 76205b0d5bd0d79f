//! The eight general testable properties, exercised under concurrency
//! where the property is about concurrency in the first place (claim
//! disjointness, sequential exclusivity, dedup races) and as direct
//! invariant checks where it isn't.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use queue_testing::InMemoryStore;

use crate::cancel::CancelToken;
use crate::facade::{Facade, FacadeOptions};
use crate::model::{JobStatus, NewJob, QueueSpec, RetryPolicy};
use crate::periodic::{CatchUpStrategy, PeriodicDefinition, PeriodicEngine};
use crate::processor::{Handler, JobProcessor, ProcessorOptions};
use crate::rescuer::{Rescuer, RescuerOptions};
use crate::store::Store;
use crate::tracker::ExecutionTracker;

#[tokio::test]
async fn property1_terminal_status_never_exceeds_max_retries() {
    let store = Arc::new(InMemoryStore::new());
    for max_retries in [1, 2, 3, 5] {
        let mut spec = QueueSpec::new(format!("p1-{max_retries}"), "default");
        spec.max_retries = max_retries;
        let queue = store.upsert_queue(spec).await.unwrap();
        let ids = store
            .add_jobs(&queue.name, &queue.partition_key, vec![NewJob::new("always-fails", json!({}))])
            .await
            .unwrap();
        let job_id = ids[0];
        let policy = RetryPolicy::from(&queue);

        loop {
            store
                .fail_jobs(&[job_id], policy, json!({"name": "Error", "message": "boom"}))
                .await
                .unwrap();
            let job = store.get_job(job_id).await.unwrap();
            assert_eq!(job.errors.len() as i32, job.attempts, "one errors entry per attempt so far");
            if job.status == JobStatus::Failed {
                assert_eq!(job.attempts, max_retries, "terminal transition should land exactly at max_retries");
                break;
            }
            assert!(job.attempts < max_retries);
        }
    }
}

#[tokio::test]
async fn property2_concurrent_idempotent_enqueues_collapse_to_one_row() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("idempotent", "default")).await.unwrap();

    let mut set: JoinSet<Vec<Uuid>> = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        let queue = queue.clone();
        set.spawn(async move {
            let mut job = NewJob::new("once", json!({}));
            job.idempotent_key = Some("only-once".to_string());
            store.add_jobs(&queue.name, &queue.partition_key, vec![job]).await.unwrap()
        });
    }
    let mut total_inserted = 0;
    while let Some(res) = set.join_next().await {
        total_inserted += res.unwrap().len();
    }
    assert_eq!(total_inserted, 1, "16 concurrent enqueues sharing an idempotentKey must yield exactly one row");

    let rows = store.jobs_in_queue(queue.id).await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn property3_pending_dedup_allows_reenqueue_after_terminal_state() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("live-dedup", "default")).await.unwrap();

    let mut set: JoinSet<Vec<Uuid>> = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        let queue = queue.clone();
        set.spawn(async move {
            let mut job = NewJob::new("ping", json!({}));
            job.pending_dedup_key = Some("only-live".to_string());
            store.add_jobs(&queue.name, &queue.partition_key, vec![job]).await.unwrap()
        });
    }
    let mut inserted_ids = Vec::new();
    while let Some(res) = set.join_next().await {
        inserted_ids.extend(res.unwrap());
    }
    assert_eq!(inserted_ids.len(), 1, "only one non-terminal row should survive concurrent enqueues");

    let job_id = inserted_ids[0];
    let claimed = store.claim_pending(queue.id, 10, false).await.unwrap();
    assert_eq!(claimed.len(), 1);
    store.mark_completed(&[job_id]).await.unwrap();

    let mut second_job = NewJob::new("ping", json!({}));
    second_job.pending_dedup_key = Some("only-live".to_string());
    let second_ids = store.add_jobs(&queue.name, &queue.partition_key, vec![second_job]).await.unwrap();
    assert_eq!(second_ids.len(), 1, "a fresh enqueue after the prior row went terminal must succeed");
    assert_ne!(second_ids[0], job_id);
}

#[tokio::test]
async fn property4_claims_are_disjoint_across_concurrent_workers() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("fan-out", "default")).await.unwrap();
    let jobs: Vec<NewJob> = (0..40).map(|i| NewJob::new("work", json!({"i": i}))).collect();
    let ids = store.add_jobs(&queue.name, &queue.partition_key, jobs).await.unwrap();
    assert_eq!(ids.len(), 40);

    let seen: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
    let handler: Handler = {
        let seen = seen.clone();
        Arc::new(move |jobs: Vec<crate::model::Job>, _cancel, _ctx| {
            let seen = seen.clone();
            Box::pin(async move {
                let mut guard = seen.lock().await;
                for job in &jobs {
                    assert!(guard.insert(job.id), "job {} claimed by more than one worker concurrently", job.id);
                }
                drop(guard);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            })
        })
    };

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
        assert!(rounds <= 80, "jobs did not drain within a bounded number of concurrent rounds");

        let mut set: JoinSet<()> = JoinSet::new();
        for _ in 0..8 {
            let processor = processor.clone();
            let token = token.clone();
            set.spawn(async move {
                let _ = processor.run_once(&token).await;
            });
        }
        while set.join_next().await.is_some() {}

        let mut done = 0;
        for id in &ids {
            if store.get_job(*id).await.unwrap().status == JobStatus::Completed {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
    }
}

#[tokio::test]
async fn property5_sequential_key_intervals_stay_disjoint_across_many_keys() {
    let store = Arc::new(InMemoryStore::new());
    let mut spec = QueueSpec::new("multi-sequential", "default");
    spec.sequential = true;
    let queue = store.upsert_queue(spec).await.unwrap();

    let keys = ["u:1", "u:2", "u:3", "u:4"];
    let mut seeded = Vec::new();
    for key in keys {
        for i in 0..3 {
            let mut job = NewJob::new("keyed", json!({"i": i}));
            job.sequential_key = Some(key.to_string());
            seeded.push(job);
        }
    }
    let total = seeded.len();
    let ids = store.add_jobs(&queue.name, &queue.partition_key, seeded).await.unwrap();
    assert_eq!(ids.len(), total);

    let intervals: Arc<Mutex<Vec<(String, tokio::time::Instant, tokio::time::Instant)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let handler: Handler = {
        let intervals = intervals.clone();
        Arc::new(move |jobs: Vec<crate::model::Job>, _cancel, _ctx| {
            let intervals = intervals.clone();
            Box::pin(async move {
                let start = tokio::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(10)).await;
                let end = tokio::time::Instant::now();
                let mut guard = intervals.lock().await;
                for job in &jobs {
                    guard.push((job.sequential_key.clone().unwrap_or_default(), start, end));
                }
                Ok(())
            })
        })
    };

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
        assert!(rounds <= 80, "jobs did not drain within a bounded number of concurrent rounds");

        let mut set: JoinSet<()> = JoinSet::new();
        for _ in 0..3 {
            let processor = processor.clone();
            let token = token.clone();
            set.spawn(async move {
                let _ = processor.run_once(&token).await;
            });
        }
        while set.join_next().await.is_some() {}

        let mut done = 0;
        for id in &ids {
            if store.get_job(*id).await.unwrap().status == JobStatus::Completed {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
    }

    let guard = intervals.lock().await;
    for key in keys {
        let observed: Vec<_> = guard.iter().filter(|(k, _, _)| k == key).map(|(_, s, e)| (*s, *e)).collect();
        assert_eq!(observed.len(), 3);
        for i in 0..observed.len() {
            for j in (i + 1)..observed.len() {
                let (s1, e1) = observed[i];
                let (s2, e2) = observed[j];
                let overlap = s1 < e2 && s2 < e1;
                assert!(!overlap, "sequentialKey {key} saw overlapping intervals {:?} vs {:?}", observed[i], observed[j]);
            }
        }
    }
}

#[tokio::test]
async fn property6_timeout_finalizes_the_cycle_and_invalidates_late_completion() {
    let store = Arc::new(InMemoryStore::new());
    let mut spec = QueueSpec::new("slow", "default");
    spec.max_duration_ms = 20;
    spec.max_retries = 3;
    let queue = store.upsert_queue(spec).await.unwrap();
    let ids = store
        .add_jobs(&queue.name, &queue.partition_key, vec![NewJob::new("slow-job", json!({}))])
        .await
        .unwrap();
    let job_id = ids[0];

    let handler: Handler = Arc::new(|jobs: Vec<crate::model::Job>, _cancel, _ctx| {
        let _ = jobs;
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
    });

    let store_dyn: Arc<dyn Store> = store.clone();
    let processor = JobProcessor::new(store_dyn, queue.id, handler, ProcessorOptions::default(), ExecutionTracker::new());
    let token = CancelToken::new();
    let progressed = processor.run_once(&token).await.unwrap();
    assert!(progressed);

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending, "a timed-out attempt should retry, not stay running");
    assert_eq!(job.attempts, 1);
    let last_error = job.errors.last().unwrap();
    assert_eq!(last_error.error["name"], "TimeoutError");

    // The cycle already finalized this job via fail_jobs; a stale completion
    // attempt (as if the slow handler's own work finished after the timeout
    // fired) must not affect a row that already left `running`.
    let affected = store.mark_completed(&[job_id]).await.unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn property7_stuck_running_jobs_are_rescued_and_routed_through_retry() {
    let store = Arc::new(InMemoryStore::new());
    let queue = store.upsert_queue(QueueSpec::new("rescue", "default")).await.unwrap();
    let ids = store
        .add_jobs(&queue.name, &queue.partition_key, vec![NewJob::new("stuck", json!({}))])
        .await
        .unwrap();
    let job_id = ids[0];

    store.force_running(job_id, Utc::now() - chrono::Duration::milliseconds(40_000_000)).await;

    let store_dyn: Arc<dyn Store> = store.clone();
    let rescuer = Rescuer::new(
        store_dyn,
        RescuerOptions {
            rescue_after_ms: 3_600_000,
            ..RescuerOptions::default()
        },
    );
    rescuer.run_once().await.unwrap();

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].error["name"], "RescuerError");
    assert_eq!(job.errors[0].error["message"], "Job stuck in running state and was rescued");
}

#[tokio::test]
async fn property8_periodic_catch_up_is_idempotent_across_repeated_registration() {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let facade = Facade::new(store_dyn, FacadeOptions::default());
    let queue = facade.upsert_queue(QueueSpec::new("digest", "default")).await.unwrap();

    let last_run_at = Utc::now() - chrono::Duration::minutes(3);
    facade.store().upsert_periodic_state("nightly", Some(last_run_at), last_run_at).await.unwrap();

    let engine = Arc::new(PeriodicEngine::new(facade.clone()));
    let mut def = PeriodicDefinition::new("nightly", "0 * * * * *", "digest");
    def.catch_up = CatchUpStrategy::All;

    engine.register(def.clone()).await.unwrap();
    let first_pass = store.jobs_in_queue(queue.id).await;
    assert!(!first_pass.is_empty(), "missed runs should have been caught up");
    let first_count = first_pass.len();

    // A second registration (simulating a process restart before the next
    // fire) must not enqueue duplicates: the idempotentKey formula is
    // derived purely from the definition name and the missed instant.
    engine.register(def).await.unwrap();
    let second_pass = store.jobs_in_queue(queue.id).await;
    assert_eq!(second_pass.len(), first_count, "repeated catch-up registration must not duplicate jobs");

    let mut seen_keys = HashSet::new();
    for job in &second_pass {
        let key = job.idempotent_key.clone().expect("catch-up jobs carry an idempotentKey");
        assert!(key.starts_with("periodic:nightly:"));
        assert!(seen_keys.insert(key), "idempotentKey formula must be unique per distinct instant");
    }
}

#[tokio::test]
async fn paused_queue_is_not_claimed_from_until_resumed() {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let facade = Facade::new(store_dyn.clone(), FacadeOptions::default());
    let queue = facade.upsert_queue(QueueSpec::new("gated", "default")).await.unwrap();
    facade
        .enqueue_default("gated", vec![NewJob::new("work", json!({}))])
        .await
        .unwrap();

    facade.pause("gated", "default").await.unwrap();

    let handler: Handler = Arc::new(|jobs: Vec<crate::model::Job>, _cancel, _ctx| {
        let _ = jobs;
        Box::pin(async move { Ok(()) })
    });
    let processor = JobProcessor::new(store_dyn.clone(), queue.id, handler, ProcessorOptions::default(), ExecutionTracker::new());
    let token = CancelToken::new();

    let progressed = processor.run_once(&token).await.unwrap();
    assert!(!progressed, "a paused queue must not claim anything");
    let rows = store.jobs_in_queue(queue.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, JobStatus::Pending, "job must stay pending while paused");

    facade.resume("gated", "default").await.unwrap();
    let progressed = processor.run_once(&token).await.unwrap();
    assert!(progressed, "resuming must allow the next cycle to claim again");
    let rows = store.jobs_in_queue(queue.id).await;
    assert_eq!(rows[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn upserting_an_existing_queue_never_resets_its_paused_flag() {
    let store = Arc::new(InMemoryStore::new());
    let spec = QueueSpec::new("stable", "default");
    let queue = store.upsert_queue(spec.clone()).await.unwrap();
    assert!(!queue.paused);

    store.set_paused("stable", "default", true).await.unwrap();
    let paused_queue = store.get_queue("stable", "default").await.unwrap().unwrap();
    assert!(paused_queue.paused);

    // Re-upserting with changed policy fields must not un-pause the queue -
    // `QueueSpec` has no `paused` field precisely so a caller cannot
    // accidentally clear it through an update.
    let mut updated_spec = spec;
    updated_spec.max_retries = 9;
    let updated = store.upsert_queue(updated_spec).await.unwrap();
    assert_eq!(updated.max_retries, 9);
    assert!(updated.paused, "upsert must never reset the paused flag");
}
