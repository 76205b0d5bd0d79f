//! `MySqlSession`: a `StoreSession` backed by a held `sqlx::Transaction`.
//! Every write lands in the same transaction; nothing is visible to other
//! connections until `commit` runs, and dropping the session without
//! committing rolls everything back (sqlx's `Transaction::drop` behavior).

use async_trait::async_trait;
use queue_core::error::{QueueError, Result};
use queue_core::model::{NewJob, Workflow};
use queue_core::store::StoreSession;
use sqlx::{MySql, Transaction};
use uuid::Uuid;

use crate::store::{get_workflow_for_update, save_workflow_with};

pub struct MySqlSession {
    tx: std::sync::Mutex<Option<Transaction<'static, MySql>>>,
    prefix: String,
}

impl MySqlSession {
    pub fn new(tx: Transaction<'static, MySql>, prefix: String) -> Self {
        Self { tx: std::sync::Mutex::new(Some(tx)), prefix }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Take the transaction out so it can be used across an `await` point
    /// (a `std::sync::Mutex` guard can't be held there); put it back after.
    fn take(&self) -> Result<Transaction<'static, MySql>> {
        self.tx
            .lock()
            .expect("session mutex poisoned")
            .take()
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("session already committed")))
    }

    fn put_back(&self, tx: Transaction<'static, MySql>) {
        *self.tx.lock().expect("session mutex poisoned") = Some(tx);
    }
}

#[async_trait]
impl StoreSession for MySqlSession {
    async fn mark_completed(&self, job_ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.take()?;
        if job_ids.is_empty() {
            self.put_back(tx);
            return Ok(0);
        }
        let placeholders = job_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE {} SET status = 'completed', attempts = attempts + 1, completed_at = NOW(3) \
             WHERE id IN ({placeholders}) AND status = 'running'",
            self.table("jobs")
        );
        let mut query = sqlx::query(&sql);
        for id in job_ids {
            query = query.bind(id.to_string());
        }
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Store(e.into()));
        self.put_back(tx);
        Ok(result?.rows_affected())
    }

    async fn add_jobs(&self, queue_name: &str, partition_key: &str, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let mut tx = self.take()?;
        let row = sqlx::query(&format!(
            "SELECT id FROM {} WHERE name = ? AND partition_key = ?",
            self.table("queues")
        ))
        .bind(queue_name)
        .bind(partition_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QueueError::Store(e.into()));

        let row = match row {
            Ok(row) => row,
            Err(e) => {
                self.put_back(tx);
                return Err(e);
            }
        };

        let Some(row) = row else {
            self.put_back(tx);
            return Err(QueueError::QueueMissing {
                name: queue_name.to_string(),
                partition_key: partition_key.to_string(),
            });
        };
        let queue_id_str: String = sqlx::Row::get(&row, "id");
        let queue_id = match Uuid::parse_str(&queue_id_str) {
            Ok(id) => id,
            Err(e) => {
                self.put_back(tx);
                return Err(QueueError::Store(anyhow::anyhow!("invalid queue id in row: {e}")));
            }
        };

        let jobs_table = self.table("jobs");
        let result = crate::store::insert_jobs(&mut tx, &jobs_table, queue_id, jobs).await;
        self.put_back(tx);
        result
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let mut tx = self.take()?;
        let table = self.table("workflows");
        let result = get_workflow_for_update(&mut tx, &table, id).await;
        self.put_back(tx);
        result
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut tx = self.take()?;
        let table = self.table("workflows");
        let result = save_workflow_with(&mut *tx, &table, workflow).await;
        self.put_back(tx);
        result
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .expect("session mutex poisoned")
            .take()
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("session already committed")))?;
        tx.commit().await.map_err(|e| QueueError::Store(e.into()))
    }
}
