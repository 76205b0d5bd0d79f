//! Minimal worked example: connect to MySQL, register a queue, enqueue a
//! few jobs, and run a worker against them until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use queue_core::{Facade, FacadeOptions, NewJob, PeriodicDefinition, PeriodicEngine, QueueSpec, WorkOptions};
use queue_mysql::MySqlStore;
use serde_json::json;
use sqlx::mysql::MySqlPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "mysql://root@127.0.0.1:3306/queue_demo".to_string());
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    let store = Arc::new(MySqlStore::new(pool, "demo_"));
    let facade = Facade::new(store, FacadeOptions::default());
    facade.global_initialize().await?;

    let queue = facade
        .upsert_queue(QueueSpec::new("send-email", "default"))
        .await?;

    facade
        .enqueue_default(
            "send-email",
            vec![
                NewJob::new("send", json!({"to": "alice@example.com", "subject": "Welcome"})),
                NewJob::new("send", json!({"to": "bob@example.com", "subject": "Welcome"})),
            ],
        )
        .await?;

    let handler: queue_core::Handler = Arc::new(move |jobs, _cancel, _ctx| {
        Box::pin(async move {
            for job in &jobs {
                tracing::info!(job_id = %job.id, payload = %job.payload, "sending email");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        })
    });

    facade.work(&queue, handler, WorkOptions::default()).await?;

    // The periodic engine only arms timers while this instance holds
    // leadership; `install` wires it to the facade's leader election so it
    // rearms on becoming leader and disarms on losing it.
    let periodic = Arc::new(PeriodicEngine::new(facade.clone()));
    periodic.install().await;
    periodic
        .register(PeriodicDefinition::new("nightly-digest", "0 0 3 * * *", "send-email"))
        .await?;

    tracing::info!("worker running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    facade.dispose().await;
    Ok(())
}
