//! `MySqlStore`: the `queue_core::Store` implementation backed by a
//! `sqlx::MySqlPool`, adapted for a dialect with no `RETURNING` and no
//! native partial unique index.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::error::{QueueError, Result};
use queue_core::model::{cmp_claim_order, Job, NewJob, PeriodicState, Queue, QueueSpec, RetryPolicy, Workflow};
use queue_core::store::{Store, StoreSession};
use serde_json::{json, Value};
use sqlx::{MySql, MySqlPool, Row, Transaction};
use uuid::Uuid;

use crate::migrations;
use crate::rows::{job_from_row, queue_from_row, workflow_from_row};
use crate::session::MySqlSession;

fn store_err(e: sqlx::Error) -> QueueError {
    QueueError::Store(e.into())
}

/// A `Store` implementation over MySQL/MariaDB. Every table name is
/// prefixed with `prefix` so multiple logical queues can share a schema.
pub struct MySqlStore {
    pool: MySqlPool,
    prefix: String,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool, prefix: impl Into<String>) -> Self {
        Self { pool, prefix: prefix.into() }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    fn t(&self, table: &str) -> String {
        format!("{}{}", self.prefix, table)
    }
}

/// Insert `jobs` into `queue_id` inside `tx`, skipping rows whose
/// idempotent or live-dedup unique key already has a match. Shared between
/// `add_jobs` and `start_workflow`'s start-step insert.
pub(crate) async fn insert_jobs(
    tx: &mut sqlx::Transaction<'_, MySql>,
    table: &str,
    queue_id: Uuid,
    jobs: Vec<NewJob>,
) -> Result<Vec<Uuid>> {
    let mut inserted = Vec::with_capacity(jobs.len());
    for new_job in jobs {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let start_after = new_job.start_after.unwrap_or(now);
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table}
                (id, queue_id, name, payload, status, priority, created_at, start_after,
                 attempts, errors, idempotent_key, pending_dedup_key, sequential_key)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, 0, JSON_ARRAY(), ?, ?, ?)
            "#
        ))
        .bind(id.to_string())
        .bind(queue_id.to_string())
        .bind(&new_job.name)
        .bind(&new_job.payload)
        .bind(new_job.priority)
        .bind(now)
        .bind(start_after)
        .bind(&new_job.idempotent_key)
        .bind(&new_job.pending_dedup_key)
        .bind(&new_job.sequential_key)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => inserted.push(id),
            // Unique-key collision (idempotent or live-dedup) means this
            // job is a duplicate of one already pending/running - skip it,
            // not an error.
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => continue,
            Err(e) => return Err(store_err(e)),
        }
    }
    Ok(inserted)
}

#[async_trait]
impl Store for MySqlStore {
    async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool, &self.prefix)
            .await
            .map_err(QueueError::Store)
    }

    async fn upsert_queue(&self, spec: QueueSpec) -> Result<Queue> {
        let id = Uuid::new_v4();
        sqlx::query(&format!(
            r#"
            INSERT INTO {queues}
                (id, name, partition_key, max_retries, min_delay_ms, backoff_multiplier,
                 max_duration_ms, paused, sequential)
            VALUES (?, ?, ?, ?, ?, ?, ?, FALSE, ?)
            ON DUPLICATE KEY UPDATE
                max_retries = VALUES(max_retries),
                min_delay_ms = VALUES(min_delay_ms),
                backoff_multiplier = VALUES(backoff_multiplier),
                max_duration_ms = VALUES(max_duration_ms),
                sequential = VALUES(sequential)
            "#,
            queues = self.t("queues")
        ))
        .bind(id.to_string())
        .bind(&spec.name)
        .bind(&spec.partition_key)
        .bind(spec.max_retries)
        .bind(spec.min_delay_ms)
        .bind(spec.backoff_multiplier)
        .bind(spec.max_duration_ms)
        .bind(spec.sequential)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        self.get_queue(&spec.name, &spec.partition_key)
            .await?
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("queue vanished immediately after upsert")))
    }

    async fn get_queue(&self, name: &str, partition_key: &str) -> Result<Option<Queue>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE name = ? AND partition_key = ?",
            self.t("queues")
        ))
        .bind(name)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn get_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", self.t("queues")))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn set_paused(&self, name: &str, partition_key: &str, paused: bool) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET paused = ? WHERE name = ? AND partition_key = ?",
            self.t("queues")
        ))
        .bind(paused)
        .bind(name)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str, partition_key: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE name = ? AND partition_key = ?",
            self.t("queues")
        ))
        .bind(name)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn purge_partition(&self, partition_key: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE partition_key = ?", self.t("queues")))
            .bind(partition_key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn add_jobs(&self, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let queue = self
            .get_queue(queue_name, partition_key)
            .await?
            .ok_or_else(|| QueueError::QueueMissing {
                name: queue_name.to_string(),
                partition_key: partition_key.to_string(),
            })?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let inserted = insert_jobs(&mut tx, &self.t("jobs"), queue.id, jobs).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(inserted)
    }

    async fn claim_pending(&self, queue_id: Uuid, limit: i64, sequential: bool) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let jobs_table = self.t("jobs");

        // MySQL has no `UPDATE ... RETURNING`, so claiming is three steps
        // inside one transaction: gather candidate ids under
        // `FOR UPDATE SKIP LOCKED`, update them, then re-select the full
        // rows. The sequential-key exclusion is expressed as a correlated
        // subquery so it can run entirely in SQL rather than pulling every
        // row of the queue into memory.
        let candidate_sql = if sequential {
            format!(
                r#"
                SELECT id FROM {jobs_table} j
                WHERE j.queue_id = ? AND j.status = 'pending' AND j.start_after <= NOW(3)
                AND NOT EXISTS (
                    SELECT 1 FROM {jobs_table} o
                    WHERE o.queue_id = j.queue_id
                      AND o.id != j.id
                      AND o.sequential_key = j.sequential_key
                      AND j.sequential_key IS NOT NULL
                      AND (o.status = 'running' OR (o.status = 'pending' AND o.created_at < j.created_at))
                )
                ORDER BY j.created_at ASC, j.priority DESC, j.id ASC
                LIMIT ?
                FOR UPDATE SKIP LOCKED
                "#
            )
        } else {
            format!(
                r#"
                SELECT id FROM {jobs_table}
                WHERE queue_id = ? AND status = 'pending' AND start_after <= NOW(3)
                ORDER BY created_at ASC, priority DESC, id ASC
                LIMIT ?
                FOR UPDATE SKIP LOCKED
                "#
            )
        };

        let ids: Vec<String> = sqlx::query(&candidate_sql)
            .bind(queue_id.to_string())
            .bind(limit.max(0))
            .fetch_all(&mut *tx)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|row| row.get::<String, _>("id"))
            .collect();

        if ids.is_empty() {
            tx.commit().await.map_err(store_err)?;
            return Ok(Vec::new());
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let update_sql = format!(
            "UPDATE {jobs_table} SET status = 'running', running_at = NOW(3) WHERE id IN ({placeholders})"
        );
        let mut update_query = sqlx::query(&update_sql);
        for id in &ids {
            update_query = update_query.bind(id);
        }
        update_query.execute(&mut *tx).await.map_err(store_err)?;

        let select_sql = format!("SELECT * FROM {jobs_table} WHERE id IN ({placeholders})");
        let mut select_query = sqlx::query(&select_sql);
        for id in &ids {
            select_query = select_query.bind(id);
        }
        let rows = select_query.fetch_all(&mut *tx).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        let mut jobs: Vec<Job> = rows.iter().map(job_from_row).collect::<Result<_>>()?;
        jobs.sort_by(cmp_claim_order);
        Ok(jobs)
    }

    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = job_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE {} SET status = 'completed', attempts = attempts + 1, completed_at = NOW(3) \
             WHERE id IN ({placeholders}) AND status = 'running'",
            self.t("jobs")
        );
        let mut query = sqlx::query(&sql);
        for id in job_ids {
            query = query.bind(id.to_string());
        }
        let result = query.execute(&self.pool).await.map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn fail_jobs(&self, job_ids: &[Uuid], policy: RetryPolicy, error: Value) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let jobs_table = self.t("jobs");
        for id in job_ids {
            let row = sqlx::query(&format!("SELECT attempts FROM {jobs_table} WHERE id = ? FOR UPDATE"))
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?;
            let Some(row) = row else { continue };
            let attempts: i32 = row.get("attempts");
            let next_attempt = attempts + 1;
            let now = Utc::now();
            let error_entry = json!({ "at": now, "attempt": next_attempt, "error": error });

            sqlx::query(&format!(
                "UPDATE {jobs_table} SET errors = JSON_ARRAY_APPEND(errors, '$', CAST(? AS JSON)) WHERE id = ?"
            ))
            .bind(error_entry.to_string())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            if next_attempt < policy.max_retries {
                // Terminal iff this attempt reaches max_retries - matches the
                // invariant that a terminally-failed job has attempts <=
                // max_retries (compare against the post-increment count, not
                // the pre-increment one). Same exponent convention as the
                // in-memory store: `attempts` here is the pre-increment
                // count, so the first retry's exponent is 0 and its delay is
                // exactly `min_delay_ms`.
                let delay_ms = (policy.min_delay_ms as f64) * policy.backoff_multiplier.powi(attempts);
                let delay_ms = (delay_ms.round() as i64).max(0);
                sqlx::query(&format!(
                    "UPDATE {jobs_table} SET status = 'pending', running_at = NULL, attempts = ?, \
                     start_after = ? WHERE id = ?"
                ))
                .bind(next_attempt)
                .bind(now + chrono::Duration::milliseconds(delay_ms))
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            } else {
                sqlx::query(&format!(
                    "UPDATE {jobs_table} SET status = 'failed', attempts = ?, failed_at = ? WHERE id = ?"
                ))
                .bind(next_attempt)
                .bind(now)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            }
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn pending_jobs_stuck(&self, horizon: Duration, limit: i64) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::zero());
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE status = 'running' AND running_at < ? ORDER BY running_at ASC LIMIT ?",
            self.t("jobs")
        ))
        .bind(cutoff)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn try_acquire_leadership(&self, singleton_key: &str, instance_id: &str, lease_ms: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(lease_ms);
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (singleton_key, leader_id, elected_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                leader_id = IF(expires_at < VALUES(elected_at) OR leader_id = VALUES(leader_id), VALUES(leader_id), leader_id),
                elected_at = IF(expires_at < VALUES(elected_at) OR leader_id = VALUES(leader_id), VALUES(elected_at), elected_at),
                expires_at = IF(expires_at < VALUES(elected_at) OR leader_id = VALUES(leader_id), VALUES(expires_at), expires_at)
            "#,
            table = self.t("leader_election")
        ))
        .bind(singleton_key)
        .bind(instance_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        // MySQL reports 1 row for a plain insert, 2 for an update that
        // actually changed a value, 0 for an update that was a no-op. Any
        // of those can mean "we are leader" - confirm by re-reading.
        let _ = result;
        let row = sqlx::query(&format!(
            "SELECT leader_id FROM {} WHERE singleton_key = ?",
            self.t("leader_election")
        ))
        .bind(singleton_key)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        let leader_id: String = row.get("leader_id");
        Ok(leader_id == instance_id)
    }

    async fn renew_leadership(&self, singleton_key: &str, instance_id: &str, lease_ms: i64) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::milliseconds(lease_ms);
        let result = sqlx::query(&format!(
            "UPDATE {} SET expires_at = ? WHERE singleton_key = ? AND leader_id = ?",
            self.t("leader_election")
        ))
        .bind(expires_at)
        .bind(singleton_key)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_leadership(&self, singleton_key: &str, instance_id: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE singleton_key = ? AND leader_id = ?",
            self.t("leader_election")
        ))
        .bind(singleton_key)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_periodic_state(&self, name: &str) -> Result<Option<PeriodicState>> {
        let row = sqlx::query(&format!(
            "SELECT name, last_run_at, next_run_at FROM {} WHERE name = ?",
            self.t("periodic_jobs")
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|row| PeriodicState {
            name: row.get("name"),
            last_run_at: row.get("last_run_at"),
            next_run_at: row.get::<DateTime<Utc>, _>("next_run_at"),
        }))
    }

    async fn upsert_periodic_state(
        &self,
        name: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (name, last_run_at, next_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                last_run_at = VALUES(last_run_at),
                next_run_at = VALUES(next_run_at),
                updated_at = VALUES(updated_at)
            "#,
            table = self.t("periodic_jobs")
        ))
        .bind(name)
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_periodic_state(&self, name: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE name = ?", self.t("periodic_jobs")))
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
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
        let queue = self
            .get_queue(workflow_queue_name, partition_key)
            .await?
            .ok_or_else(|| QueueError::QueueMissing {
                name: workflow_queue_name.to_string(),
                partition_key: partition_key.to_string(),
            })?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {table}
                (id, definition_name, current_step, data, step_results, completed_steps,
                 pending_steps, status, created_at)
            VALUES (?, ?, ?, ?, JSON_OBJECT(), JSON_ARRAY(), JSON_ARRAY(?), 'active', ?)
            "#,
            table = self.t("workflows")
        ))
        .bind(id.to_string())
        .bind(definition_name)
        .bind(start_step)
        .bind(&data)
        .bind(start_step)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let mut job = NewJob::new(
            "workflow-step",
            json!({ "workflowId": id, "context": data.clone(), "step": { "name": start_step } }),
        );
        job.pending_dedup_key = Some(format!("{id}:{start_step}"));
        insert_jobs(&mut tx, &self.t("jobs"), queue.id, vec![job]).await?;

        tx.commit().await.map_err(store_err)?;

        self.get_workflow(id)
            .await?
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("workflow vanished immediately after creation")))
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", self.t("workflows")))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        save_workflow_with(&self.pool, &self.t("workflows"), workflow).await
    }

    async fn begin_session(&self) -> Result<Box<dyn StoreSession>> {
        let tx = self.pool.begin().await.map_err(store_err)?;
        Ok(Box::new(MySqlSession::new(tx, self.prefix.clone())))
    }

    async fn drop_all_tables(&self) -> Result<()> {
        migrations::drop_all_tables(&self.pool, &self.prefix).await.map_err(QueueError::Store)
    }
}

/// Used by `MySqlSession::get_workflow` - locks the row for the remainder
/// of the caller's transaction so a concurrent step converging on the same
/// workflow cannot read a stale `pending_steps`/`completed_steps` snapshot
/// out from under it.
pub(crate) async fn get_workflow_for_update(
    tx: &mut Transaction<'static, MySql>,
    table: &str,
    id: Uuid,
) -> Result<Option<Workflow>> {
    let row = sqlx::query(&format!("SELECT * FROM {table} WHERE id = ? FOR UPDATE"))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_err)?;
    row.as_ref().map(workflow_from_row).transpose()
}

/// Shared by `Store::save_workflow` and `StoreSession::save_workflow` -
/// both just overwrite every mutable column of the workflow row.
pub(crate) async fn save_workflow_with<'e, E>(executor: E, table: &str, workflow: &Workflow) -> Result<()>
where
    E: sqlx::Executor<'e, Database = MySql>,
{
    sqlx::query(&format!(
        r#"
        UPDATE {table} SET
            current_step = ?, data = ?, step_results = ?, completed_steps = ?,
            pending_steps = ?, status = ?, completed_at = ?, failed_at = ?, failure_reason = ?
        WHERE id = ?
        "#
    ))
    .bind(&workflow.current_step)
    .bind(&workflow.data)
    .bind(Value::Object(workflow.step_results.clone()))
    .bind(json!(workflow.completed_steps))
    .bind(json!(workflow.pending_steps))
    .bind(workflow.status.as_str())
    .bind(workflow.completed_at)
    .bind(workflow.failed_at)
    .bind(&workflow.failure_reason)
    .bind(workflow.id.to_string())
    .execute(executor)
    .await
    .map_err(store_err)?;
    Ok(())
}
