//! Embedded schema migrations, applied under a process-wide advisory lock
//! keyed by the table prefix so multiple instances booting concurrently
//! don't race on `CREATE TABLE`.

use anyhow::Context;
use sqlx::MySqlPool;

/// One migration: a stable name (used as the dedup key in the migrations
/// table) and the SQL to run inside its own transaction.
struct Migration {
    name: &'static str,
    sql: fn(&str) -> String,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_queues",
        sql: |p| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {p}queues (
                    id CHAR(36) PRIMARY KEY,
                    name VARCHAR(255) NOT NULL,
                    partition_key VARCHAR(255) NOT NULL,
                    max_retries INT NOT NULL,
                    min_delay_ms BIGINT NOT NULL,
                    backoff_multiplier DOUBLE NOT NULL,
                    max_duration_ms BIGINT NOT NULL,
                    paused BOOLEAN NOT NULL DEFAULT FALSE,
                    sequential BOOLEAN NOT NULL DEFAULT FALSE,
                    UNIQUE KEY uq_{p}queues_name_partition (name, partition_key)
                )
                "#
            )
        },
    },
    Migration {
        name: "0002_jobs",
        sql: |p| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {p}jobs (
                    id CHAR(36) PRIMARY KEY,
                    queue_id CHAR(36) NOT NULL,
                    name VARCHAR(255) NOT NULL,
                    payload JSON NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    priority INT NOT NULL DEFAULT 0,
                    created_at DATETIME(3) NOT NULL,
                    start_after DATETIME(3) NOT NULL,
                    running_at DATETIME(3) NULL,
                    completed_at DATETIME(3) NULL,
                    failed_at DATETIME(3) NULL,
                    attempts INT NOT NULL DEFAULT 0,
                    errors JSON NOT NULL,
                    idempotent_key VARCHAR(255) NULL,
                    pending_dedup_key VARCHAR(255) NULL,
                    sequential_key VARCHAR(255) NULL,
                    -- NULL except while non-terminal, so the unique index
                    -- below only enforces dedup for pending/running rows.
                    live_dedup_key VARCHAR(255) GENERATED ALWAYS AS
                        (CASE WHEN status IN ('pending', 'running') THEN pending_dedup_key ELSE NULL END) STORED,
                    CONSTRAINT fk_{p}jobs_queue FOREIGN KEY (queue_id) REFERENCES {p}queues(id) ON DELETE CASCADE,
                    UNIQUE KEY uq_{p}jobs_idempotent (queue_id, name, idempotent_key),
                    UNIQUE KEY uq_{p}jobs_live_dedup (queue_id, name, live_dedup_key),
                    KEY idx_{p}jobs_claim (queue_id, status, created_at, priority, id)
                )
                "#
            )
        },
    },
    Migration {
        name: "0003_migrations_self_record",
        // The migrations table itself is created before this loop runs
        // (see `run_migrations`); this entry exists so its application is
        // recorded like any other, keeping the ledger honest.
        sql: |_p| "SELECT 1".to_string(),
    },
    Migration {
        name: "0004_periodic_jobs",
        sql: |p| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {p}periodic_jobs (
                    name VARCHAR(255) PRIMARY KEY,
                    last_run_at DATETIME(3) NULL,
                    next_run_at DATETIME(3) NOT NULL,
                    definition JSON NULL,
                    created_at DATETIME(3) NOT NULL,
                    updated_at DATETIME(3) NOT NULL
                )
                "#
            )
        },
    },
    Migration {
        name: "0005_leader_election",
        sql: |p| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {p}leader_election (
                    singleton_key VARCHAR(255) PRIMARY KEY,
                    leader_id VARCHAR(255) NOT NULL,
                    elected_at DATETIME(3) NOT NULL,
                    expires_at DATETIME(3) NOT NULL
                )
                "#
            )
        },
    },
    Migration {
        name: "0006_workflows",
        sql: |p| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {p}workflows (
                    id CHAR(36) PRIMARY KEY,
                    definition_name VARCHAR(255) NOT NULL,
                    current_step VARCHAR(255) NOT NULL,
                    data JSON NOT NULL,
                    step_results JSON NOT NULL,
                    completed_steps JSON NOT NULL,
                    pending_steps JSON NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    created_at DATETIME(3) NOT NULL,
                    completed_at DATETIME(3) NULL,
                    failed_at DATETIME(3) NULL,
                    failure_reason TEXT NULL
                )
                "#
            )
        },
    },
];

/// Acquire the advisory lock keyed by `prefix` (10s timeout; returns
/// without error if another instance is already migrating), create the
/// migrations table if absent, then apply each unapplied migration in
/// order inside its own transaction.
pub async fn run_migrations(pool: &MySqlPool, prefix: &str) -> anyhow::Result<()> {
    let lock_key = format!("queue-migrations:{prefix}");
    let mut lock_conn = pool.acquire().await.context("acquiring connection for migration lock")?;

    let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 10)")
        .bind(&lock_key)
        .fetch_one(&mut *lock_conn)
        .await
        .context("acquiring migration advisory lock")?;
    if acquired != Some(1) {
        tracing::info!(prefix, "another instance is migrating, skipping");
        return Ok(());
    }

    let result = apply_all(pool, prefix).await;

    let _: Option<i64> = sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
        .bind(&lock_key)
        .fetch_one(&mut *lock_conn)
        .await
        .context("releasing migration advisory lock")?;

    result
}

async fn apply_all(pool: &MySqlPool, prefix: &str) -> anyhow::Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {prefix}migrations (
            id INT AUTO_INCREMENT PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at DATETIME(3) NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await
    .context("creating migrations table")?;

    for migration in MIGRATIONS {
        let already_applied: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {prefix}migrations WHERE name = ?"
        ))
        .bind(migration.name)
        .fetch_optional(pool)
        .await
        .context("checking migration state")?
        .flatten();
        if already_applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(&(migration.sql)(prefix))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("applying migration {}", migration.name))?;
        sqlx::query(&format!(
            "INSERT INTO {prefix}migrations (name, applied_at) VALUES (?, NOW(3))"
        ))
        .bind(migration.name)
        .execute(&mut *tx)
        .await
        .context("recording migration")?;
        tx.commit().await.context("committing migration")?;
        tracing::info!(migration = migration.name, "applied migration");
    }

    Ok(())
}

/// Drop every table this store owns, in reverse-migration order.
pub async fn drop_all_tables(pool: &MySqlPool, prefix: &str) -> anyhow::Result<()> {
    let tables = [
        format!("{prefix}workflows"),
        format!("{prefix}leader_election"),
        format!("{prefix}periodic_jobs"),
        format!("{prefix}jobs"),
        format!("{prefix}queues"),
        format!("{prefix}migrations"),
    ];
    for table in tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(pool)
            .await
            .with_context(|| format!("dropping table {table}"))?;
    }
    Ok(())
}
