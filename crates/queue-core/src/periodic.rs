//! Definition registry + timer-driven enqueuer for periodic jobs. Only runs
//! while this instance holds leadership; losing leadership disarms timers
//! but keeps the registry so regaining leadership rearms them.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{QueueError, Result};
use crate::facade::Facade;
use crate::model::NewJob;

/// Strategy applied to runs missed while this engine (or any instance) was
/// not leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpStrategy {
    /// Drop every missed run.
    None,
    /// Enqueue exactly one job for the most recently missed instant.
    Latest,
    /// Enqueue one job per missed instant, oldest first, capped at
    /// `max_catch_up`.
    All,
}

#[derive(Debug, Clone)]
pub struct PeriodicDefinition {
    pub name: String,
    pub cron_expr: String,
    pub queue_name: String,
    pub partition_key: String,
    pub payload: Value,
    pub catch_up: CatchUpStrategy,
    pub max_catch_up: usize,
    pub include_scheduled_time: bool,
}

impl PeriodicDefinition {
    pub fn new(name: impl Into<String>, cron_expr: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_expr: cron_expr.into(),
            queue_name: queue_name.into(),
            partition_key: "default".to_string(),
            payload: Value::Null,
            catch_up: CatchUpStrategy::None,
            max_catch_up: 100,
            include_scheduled_time: false,
        }
    }

    fn schedule(&self) -> Result<Schedule> {
        Schedule::from_str(&self.cron_expr)
            .map_err(|err| QueueError::Store(anyhow::anyhow!("invalid cron expression {:?}: {err}", self.cron_expr)))
    }
}

struct Armed {
    definition: PeriodicDefinition,
    next_run_at: DateTime<Utc>,
    handle: tokio::task::JoinHandle<()>,
}

/// Registry + leader-gated timer set. Not itself a `Scheduler` because each
/// definition runs on its own independently re-armed one-shot timer rather
/// than a fixed interval.
pub struct PeriodicEngine {
    facade: Arc<Facade>,
    definitions: Mutex<HashMap<String, PeriodicDefinition>>,
    armed: Mutex<HashMap<String, Armed>>,
}

impl PeriodicEngine {
    pub fn new(facade: Arc<Facade>) -> Self {
        Self {
            facade,
            definitions: Mutex::new(HashMap::new()),
            armed: Mutex::new(HashMap::new()),
        }
    }

    fn idempotent_key(name: &str, instant: DateTime<Utc>) -> String {
        format!("periodic:{name}:{}", instant.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }

    /// Validate the cron expression, read persisted state, apply catch-up,
    /// and arm the next one-shot timer. Call only while leader.
    pub async fn register(self: &Arc<Self>, def: PeriodicDefinition) -> Result<()> {
        let schedule = def.schedule()?;
        let now = Utc::now();
        let store = self.facade.store();

        let prior = store.get_periodic_state(&def.name).await?;
        if let Some(state) = &prior {
            if let Some(last_run_at) = state.last_run_at {
                let missed: Vec<DateTime<Utc>> = schedule
                    .after(&last_run_at)
                    .take_while(|instant| *instant <= now)
                    .collect();
                if !missed.is_empty() {
                    self.apply_catch_up(&def, &missed).await?;
                }
            }
        }

        let next_run_at = schedule
            .after(&now)
            .next()
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("cron schedule {:?} never fires again", def.cron_expr)))?;
        let last_run_at = prior.and_then(|s| s.last_run_at);
        store.upsert_periodic_state(&def.name, last_run_at, next_run_at).await?;

        self.definitions.lock().await.insert(def.name.clone(), def.clone());
        // A non-leader instance can still register definitions (building up
        // the registry `rearm_all` replays from), but only the leader arms a
        // live timer - `install` disarms everything the moment leadership is
        // lost, and registering here is exactly what `rearm_all` calls on
        // every definition once leadership is regained.
        if self.facade.leader_election().is_leader() {
            self.arm(def, next_run_at).await;
        }
        Ok(())
    }

    async fn apply_catch_up(&self, def: &PeriodicDefinition, missed: &[DateTime<Utc>]) -> Result<()> {
        let to_enqueue: Vec<DateTime<Utc>> = match def.catch_up {
            CatchUpStrategy::None => Vec::new(),
            CatchUpStrategy::Latest => missed.last().copied().into_iter().collect(),
            CatchUpStrategy::All => {
                if missed.len() > def.max_catch_up {
                    tracing::warn!(
                        name = %def.name,
                        missed = missed.len(),
                        cap = def.max_catch_up,
                        "truncating periodic catch-up"
                    );
                }
                missed.iter().take(def.max_catch_up).copied().collect()
            }
        };

        for instant in to_enqueue {
            let mut payload = def.payload.clone();
            if def.include_scheduled_time {
                merge_scheduled_time(&mut payload, instant);
            }
            let mut job = NewJob::new(def.name.clone(), payload);
            job.idempotent_key = Some(Self::idempotent_key(&def.name, instant));
            self.facade
                .enqueue(&def.queue_name, &def.partition_key, vec![job])
                .await?;
        }
        Ok(())
    }

    async fn arm(self: &Arc<Self>, def: PeriodicDefinition, next_run_at: DateTime<Utc>) {
        let delay = (next_run_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_millis(0));
        let engine = self.clone();
        let name = def.name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire(&name, next_run_at).await;
        });
        let mut armed = self.armed.lock().await;
        if let Some(previous) = armed.remove(&def.name) {
            previous.handle.abort();
        }
        armed.insert(def.name.clone(), Armed {
            definition: def,
            next_run_at,
            handle,
        });
    }

    async fn fire(self: &Arc<Self>, name: &str, scheduled_time: DateTime<Utc>) {
        let def = {
            let definitions = self.definitions.lock().await;
            match definitions.get(name) {
                Some(d) => d.clone(),
                None => return,
            }
        };

        let mut payload = def.payload.clone();
        if def.include_scheduled_time {
            merge_scheduled_time(&mut payload, scheduled_time);
        }
        let mut job = NewJob::new(def.name.clone(), payload);
        job.idempotent_key = Some(Self::idempotent_key(&def.name, scheduled_time));

        if let Err(err) = self
            .facade
            .enqueue(&def.queue_name, &def.partition_key, vec![job])
            .await
        {
            tracing::error!(name = %def.name, error = %err, "periodic enqueue failed");
        }

        let next_run_at = match def.schedule() {
            Ok(schedule) => schedule.after(&scheduled_time).next(),
            Err(_) => None,
        };
        let Some(next_run_at) = next_run_at else {
            tracing::error!(name = %def.name, "periodic schedule produced no further runs");
            return;
        };

        if let Err(err) = self
            .facade
            .store()
            .upsert_periodic_state(&def.name, Some(scheduled_time), next_run_at)
            .await
        {
            tracing::error!(name = %def.name, error = %err, "failed to persist periodic state");
        }

        self.arm(def, next_run_at).await;
    }

    /// Cancel the timer and delete persisted state.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if let Some(armed) = self.armed.lock().await.remove(name) {
            armed.handle.abort();
        }
        self.definitions.lock().await.remove(name);
        self.facade.store().delete_periodic_state(name).await
    }

    /// Disarm every timer without touching the registry (called when
    /// leadership is lost).
    pub async fn disarm_all(&self) {
        let mut armed = self.armed.lock().await;
        for (_, entry) in armed.drain() {
            entry.handle.abort();
        }
    }

    /// Re-arm every registered definition from fresh persisted state
    /// (called when leadership is (re)gained).
    pub async fn rearm_all(self: &Arc<Self>) -> Result<()> {
        let definitions: Vec<PeriodicDefinition> = self.definitions.lock().await.values().cloned().collect();
        for def in definitions {
            self.register(def).await?;
        }
        Ok(())
    }

    pub async fn next_run_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.armed.lock().await.get(name).map(|a| a.next_run_at)
    }

    /// Wire this engine's timers to the facade's leader election: rearms
    /// every registered definition when leadership is (re)gained, disarms
    /// them all when it's lost. Call once after construction.
    pub async fn install(self: &Arc<Self>) {
        let election = self.facade.leader_election();

        let rearm_engine = self.clone();
        election
            .set_on_become_leader(Arc::new(move || {
                let engine = rearm_engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.rearm_all().await {
                        tracing::error!(error = %err, "failed to rearm periodic engine after regaining leadership");
                    }
                });
            }))
            .await;

        let disarm_engine = self.clone();
        election
            .set_on_lose_leadership(Arc::new(move || {
                let engine = disarm_engine.clone();
                tokio::spawn(async move {
                    engine.disarm_all().await;
                });
            }))
            .await;
    }
}

fn merge_scheduled_time(payload: &mut Value, scheduled_time: DateTime<Utc>) {
    let iso = scheduled_time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    match payload {
        Value::Object(map) => {
            map.insert("_periodic".to_string(), serde_json::json!({ "scheduledTime": iso }));
        }
        Value::Null => {
            *payload = serde_json::json!({ "_periodic": { "scheduledTime": iso } });
        }
        other => {
            tracing::warn!("cannot merge _periodic.scheduledTime into non-object payload {other:?}");
        }
    }
}
