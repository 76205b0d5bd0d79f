//! Integration tests against a live MySQL/MariaDB instance. Ignored by
//! default since they need `DATABASE_URL` pointed at a throwaway schema;
//! run with `cargo test -- --ignored` once one is available.

use queue_core::model::{NewJob, QueueSpec};
use queue_core::store::Store;
use sqlx::mysql::MySqlPoolOptions;

use crate::MySqlStore;

async fn test_store() -> MySqlStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a throwaway MySQL schema");
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connecting to test database");
    let prefix = format!("t{}_", uuid::Uuid::new_v4().simple());
    let store = MySqlStore::new(pool, prefix);
    store.run_migrations().await.expect("running migrations");
    store
}

#[tokio::test]
#[ignore]
async fn upsert_and_fetch_queue_roundtrips() {
    let store = test_store().await;
    let spec = QueueSpec::new("emails", "tenant-a");
    let created = store.upsert_queue(spec).await.unwrap();
    assert!(!created.paused);

    let fetched = store.get_queue("emails", "tenant-a").await.unwrap().unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.max_retries, 3);

    store.drop_all_tables().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn claim_pending_respects_ordering_and_dedup() {
    let store = test_store().await;
    let queue = store.upsert_queue(QueueSpec::new("emails", "tenant-a")).await.unwrap();

    let mut first = NewJob::new("send", serde_json::json!({"to": "a@example.com"}));
    first.pending_dedup_key = Some("a@example.com".to_string());
    let mut duplicate = NewJob::new("send", serde_json::json!({"to": "a@example.com"}));
    duplicate.pending_dedup_key = Some("a@example.com".to_string());

    let inserted = store
        .add_jobs("emails", "tenant-a", vec![first, duplicate])
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1, "duplicate pending_dedup_key should be skipped");

    let claimed = store.claim_pending(queue.id, 10, false).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status.as_str(), "running");

    store.drop_all_tables().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn fail_jobs_retries_then_terminates() {
    let store = test_store().await;
    let mut spec = QueueSpec::new("retries", "tenant-a");
    spec.max_retries = 1;
    spec.min_delay_ms = 1000;
    let queue = store.upsert_queue(spec).await.unwrap();

    store
        .add_jobs("retries", "tenant-a", vec![NewJob::new("work", serde_json::json!({}))])
        .await
        .unwrap();
    let claimed = store.claim_pending(queue.id, 1, false).await.unwrap();
    let job_id = claimed[0].id;

    let policy = queue_core::model::RetryPolicy::from(&queue);
    store
        .fail_jobs(&[job_id], policy, serde_json::json!({"name": "Error", "message": "boom"}))
        .await
        .unwrap();

    let after_first_failure = store.get_queue_by_id(queue.id).await.unwrap().unwrap();
    let _ = after_first_failure;
    let stuck = store.pending_jobs_stuck(std::time::Duration::from_secs(0), 10).await.unwrap();
    assert!(stuck.is_empty(), "job should have gone back to pending, not stayed running");

    store.drop_all_tables().await.unwrap();
}
