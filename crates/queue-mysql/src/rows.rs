//! `sqlx::FromRow` mappings between MySQL rows and `queue_core::model` types.

use chrono::{DateTime, Utc};
use queue_core::model::{Job, JobErrorEntry, JobStatus, Queue, Workflow, WorkflowStatus};
use queue_core::{QueueError, Result};
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::Row;
use uuid::Uuid;

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| QueueError::Store(anyhow::anyhow!("invalid uuid {s:?}: {e}")))
}

pub fn queue_from_row(row: &MySqlRow) -> Result<Queue> {
    let id: String = row.try_get("id").map_err(|e| QueueError::Store(e.into()))?;
    Ok(Queue {
        id: parse_uuid(&id)?,
        name: row.try_get("name").map_err(|e| QueueError::Store(e.into()))?,
        partition_key: row.try_get("partition_key").map_err(|e| QueueError::Store(e.into()))?,
        max_retries: row.try_get("max_retries").map_err(|e| QueueError::Store(e.into()))?,
        min_delay_ms: row.try_get("min_delay_ms").map_err(|e| QueueError::Store(e.into()))?,
        backoff_multiplier: row.try_get("backoff_multiplier").map_err(|e| QueueError::Store(e.into()))?,
        max_duration_ms: row.try_get("max_duration_ms").map_err(|e| QueueError::Store(e.into()))?,
        paused: row.try_get("paused").map_err(|e| QueueError::Store(e.into()))?,
        sequential: row.try_get("sequential").map_err(|e| QueueError::Store(e.into()))?,
    })
}

pub fn job_from_row(row: &MySqlRow) -> Result<Job> {
    let id: String = row.try_get("id").map_err(|e| QueueError::Store(e.into()))?;
    let queue_id: String = row.try_get("queue_id").map_err(|e| QueueError::Store(e.into()))?;
    let status: String = row.try_get("status").map_err(|e| QueueError::Store(e.into()))?;
    let payload: Value = row.try_get("payload").map_err(|e| QueueError::Store(e.into()))?;
    let errors: Value = row.try_get("errors").map_err(|e| QueueError::Store(e.into()))?;
    let errors: Vec<JobErrorEntry> =
        serde_json::from_value(errors).map_err(|e| QueueError::Store(anyhow::anyhow!("decoding job errors: {e}")))?;

    Ok(Job {
        id: parse_uuid(&id)?,
        queue_id: parse_uuid(&queue_id)?,
        name: row.try_get("name").map_err(|e| QueueError::Store(e.into()))?,
        payload,
        priority: row.try_get("priority").map_err(|e| QueueError::Store(e.into()))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("unknown job status {status:?}")))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(|e| QueueError::Store(e.into()))?,
        start_after: row.try_get::<DateTime<Utc>, _>("start_after").map_err(|e| QueueError::Store(e.into()))?,
        running_at: row.try_get("running_at").map_err(|e| QueueError::Store(e.into()))?,
        completed_at: row.try_get("completed_at").map_err(|e| QueueError::Store(e.into()))?,
        failed_at: row.try_get("failed_at").map_err(|e| QueueError::Store(e.into()))?,
        attempts: row.try_get("attempts").map_err(|e| QueueError::Store(e.into()))?,
        errors,
        idempotent_key: row.try_get("idempotent_key").map_err(|e| QueueError::Store(e.into()))?,
        pending_dedup_key: row.try_get("pending_dedup_key").map_err(|e| QueueError::Store(e.into()))?,
        sequential_key: row.try_get("sequential_key").map_err(|e| QueueError::Store(e.into()))?,
    })
}

pub fn workflow_from_row(row: &MySqlRow) -> Result<Workflow> {
    let id: String = row.try_get("id").map_err(|e| QueueError::Store(e.into()))?;
    let status: String = row.try_get("status").map_err(|e| QueueError::Store(e.into()))?;
    let step_results: Value = row.try_get("step_results").map_err(|e| QueueError::Store(e.into()))?;
    let completed_steps: Value = row.try_get("completed_steps").map_err(|e| QueueError::Store(e.into()))?;
    let pending_steps: Value = row.try_get("pending_steps").map_err(|e| QueueError::Store(e.into()))?;

    let step_results = match step_results {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let completed_steps: Vec<String> =
        serde_json::from_value(completed_steps).map_err(|e| QueueError::Store(anyhow::anyhow!("decoding completed_steps: {e}")))?;
    let pending_steps: Vec<String> =
        serde_json::from_value(pending_steps).map_err(|e| QueueError::Store(anyhow::anyhow!("decoding pending_steps: {e}")))?;

    Ok(Workflow {
        id: parse_uuid(&id)?,
        definition_name: row.try_get("definition_name").map_err(|e| QueueError::Store(e.into()))?,
        current_step: row.try_get("current_step").map_err(|e| QueueError::Store(e.into()))?,
        data: row.try_get("data").map_err(|e| QueueError::Store(e.into()))?,
        step_results,
        completed_steps,
        pending_steps,
        status: match status.as_str() {
            "active" => WorkflowStatus::Active,
            "completed" => WorkflowStatus::Completed,
            "failed" => WorkflowStatus::Failed,
            other => return Err(QueueError::Store(anyhow::anyhow!("unknown workflow status {other:?}"))),
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(|e| QueueError::Store(e.into()))?,
        completed_at: row.try_get("completed_at").map_err(|e| QueueError::Store(e.into()))?,
        failed_at: row.try_get("failed_at").map_err(|e| QueueError::Store(e.into()))?,
        failure_reason: row.try_get("failure_reason").map_err(|e| QueueError::Store(e.into()))?,
    })
}
