//! Step-DAG interpreter: each step of a workflow runs as a regular job on a
//! dedicated queue, advancing persisted workflow state and enqueueing
//! successor steps from inside the same transaction the step completes in.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use smallvec::{smallvec, SmallVec};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::facade::Facade;
use crate::model::{NewJob, Workflow, WorkflowStatus};
use crate::processor::{Handler, JobContext};
use crate::store::StoreSession;

pub type StepResultFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A step handler: given the workflow's context, the step-scoped input
/// payload and a session shared with the rest of this step's commit, run
/// the step's work and return its result.
pub type StepHandler = Arc<dyn Fn(Value, Value) -> StepResultFuture + Send + Sync>;

/// A step's successor names - almost always zero or one, occasionally more
/// for a fan-out step, so a `SmallVec` avoids a heap allocation on the
/// common path.
pub type StepNames = SmallVec<[String; 1]>;

/// What follows a step once all of its parallel siblings finish.
#[derive(Clone)]
pub enum NextSpec {
    Fixed(StepNames),
    Dynamic(Arc<dyn Fn(&Value, &Value) -> StepNames + Send + Sync>),
}

#[derive(Clone)]
pub struct WorkflowStep {
    pub name: String,
    pub handler: StepHandler,
    pub next: Option<NextSpec>,
    pub condition: Option<Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, handler: StepHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            next: None,
            condition: None,
        }
    }

    pub fn next_to(mut self, name: impl Into<String>) -> Self {
        self.next = Some(NextSpec::Fixed(smallvec![name.into()]));
        self
    }

    pub fn next_many(mut self, names: Vec<String>) -> Self {
        self.next = Some(NextSpec::Fixed(names.into_iter().collect()));
        self
    }

    pub fn next_fn(mut self, f: Arc<dyn Fn(&Value, &Value) -> StepNames + Send + Sync>) -> Self {
        self.next = Some(NextSpec::Dynamic(f));
        self
    }

    pub fn condition(mut self, f: Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>) -> Self {
        self.condition = Some(f);
        self
    }
}

#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub start_step: String,
    pub queue_name: String,
    pub partition_key: String,
    order: Vec<String>,
    steps: HashMap<String, WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, start_step: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_step: start_step.into(),
            queue_name: queue_name.into(),
            partition_key: "default".to_string(),
            order: Vec::new(),
            steps: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.order.push(step.name.clone());
        self.steps.insert(step.name.clone(), step);
        self
    }

    fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.get(name)
    }

    fn sequential_next(&self, current: &str) -> Option<String> {
        let idx = self.order.iter().position(|n| n == current)?;
        self.order.get(idx + 1).cloned()
    }
}

/// Interprets every registered [`WorkflowDefinition`] as step jobs arrive
/// on each definition's workflow queue.
pub struct WorkflowEngine {
    facade: Arc<Facade>,
    definitions: HashMap<String, WorkflowDefinition>,
}

fn pending_dedup_key(workflow_id: Uuid, step_name: &str) -> String {
    format!("{workflow_id}:{step_name}")
}

impl WorkflowEngine {
    pub fn new(facade: Arc<Facade>, definitions: Vec<WorkflowDefinition>) -> Arc<Self> {
        Arc::new(Self {
            facade,
            definitions: definitions.into_iter().map(|d| (d.name.clone(), d)).collect(),
        })
    }

    /// Create the workflow row and enqueue its start-step job, all in one
    /// transaction.
    pub async fn start(&self, definition_name: &str, data: Value) -> Result<Workflow> {
        let def = self
            .definitions
            .get(definition_name)
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("unknown workflow definition {definition_name:?}")))?;
        self.facade
            .store()
            .start_workflow(definition_name, &def.start_step, data, &def.queue_name, &def.partition_key)
            .await
    }

    /// The job callback registered against each definition's workflow
    /// queue. Processes every job in the chunk independently; a single
    /// failure fails the whole chunk (the job callback's error propagates
    /// to the processor's normal retry path).
    pub fn handler(self: &Arc<Self>) -> Handler {
        let engine = self.clone();
        Arc::new(move |jobs, _cancel, ctx| {
            let engine = engine.clone();
            Box::pin(async move {
                for job in &jobs {
                    engine.handle_step_job(job, &ctx).await?;
                }
                Ok(())
            })
        })
    }

    async fn handle_step_job(&self, job: &crate::model::Job, ctx: &JobContext) -> anyhow::Result<()> {
        let workflow_id: Uuid = job
            .payload
            .get("workflowId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| anyhow::anyhow!("workflow step job missing workflowId"))?;
        let step_name = job
            .payload
            .get("step")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("workflow step job missing step.name"))?
            .to_string();

        let store = self.facade.store();
        // Unlocked read purely to feed the step handler its context - the
        // handler must not run while holding the row lock `advance` takes
        // below, or one slow step would stall every other step of the same
        // workflow.
        let snapshot = store
            .get_workflow(workflow_id)
            .await?
            .ok_or(QueueError::WorkflowNotFound(workflow_id))?;
        let def = self
            .definitions
            .get(&snapshot.definition_name)
            .ok_or_else(|| anyhow::anyhow!("unknown workflow definition {:?}", snapshot.definition_name))?;
        let step = def.step(&step_name).ok_or_else(|| QueueError::StepNotFound {
            definition: def.name.clone(),
            step: step_name.clone(),
        })?;

        let context = snapshot.data.clone();
        let step_input = job
            .payload
            .get("data")
            .cloned()
            .unwrap_or(Value::Null);

        let result = (step.handler)(context, step_input).await;

        match result {
            Ok(step_result) => {
                self.advance(store, def, workflow_id, &step_name, step_result, job.id, ctx)
                    .await
            }
            Err(err) => {
                let mut workflow = store.get_workflow(workflow_id).await?.unwrap_or(snapshot);
                workflow.status = WorkflowStatus::Failed;
                workflow.failed_at = Some(Utc::now());
                workflow.failure_reason = Some(format!("{step_name}: {err}"));
                if let Err(save_err) = store.save_workflow(&workflow).await {
                    tracing::error!(error = %save_err, "failed to persist workflow failure state");
                }
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        store: Arc<dyn crate::store::Store>,
        def: &WorkflowDefinition,
        workflow_id: Uuid,
        step_name: &str,
        step_result: Value,
        job_id: Uuid,
        ctx: &JobContext,
    ) -> anyhow::Result<()> {
        let session: Box<dyn StoreSession> = store.begin_session().await?;

        // The canonical state for this read-modify-write is whatever the
        // row holds right now, reloaded under the session's lock - not the
        // snapshot `handle_step_job` used to feed the step handler. Two
        // parallel steps converging on the same successor each open their
        // own session here; MySQL serializes their `SELECT ... FOR UPDATE`
        // against each other, so the second one to run sees the first's
        // `completed_steps`/`pending_steps` update rather than a stale copy.
        let mut workflow = session
            .get_workflow(workflow_id)
            .await?
            .ok_or(QueueError::WorkflowNotFound(workflow_id))?;

        workflow.completed_steps.push(step_name.to_string());
        workflow.pending_steps.retain(|s| s != step_name);
        workflow.step_results.insert(step_name.to_string(), step_result.clone());

        let mut successors = Vec::new();
        if workflow.pending_steps.is_empty() {
            let next_names = compute_next(def, step_name, &workflow.data, &step_result);
            if next_names.is_empty() {
                workflow.status = WorkflowStatus::Completed;
                workflow.completed_at = Some(Utc::now());
            } else {
                workflow.pending_steps = next_names.to_vec();
                workflow.current_step = next_names.join(",");
                for next_name in &next_names {
                    let mut job = NewJob::new(
                        "workflow-step",
                        json!({
                            "workflowId": workflow.id,
                            "context": workflow.data,
                            "step": { "name": next_name },
                            "data": step_result,
                        }),
                    );
                    job.pending_dedup_key = Some(pending_dedup_key(workflow.id, next_name));
                    successors.push(job);
                }
            }
        }

        session.save_workflow(&workflow).await?;
        if !successors.is_empty() {
            session.add_jobs(&def.queue_name, &def.partition_key, successors).await?;
        }
        ctx.complete_via_session(session, &[job_id]).await?;
        Ok(())
    }
}

fn compute_next(def: &WorkflowDefinition, step_name: &str, context: &Value, step_result: &Value) -> StepNames {
    let step = match def.step(step_name) {
        Some(s) => s,
        None => return StepNames::new(),
    };
    if let Some(next) = &step.next {
        return match next {
            NextSpec::Fixed(names) => names.clone(),
            NextSpec::Dynamic(f) => f(context, step_result),
        };
    }
    if let Some(condition) = &step.condition {
        if !condition(context, step_result) {
            return StepNames::new();
        }
    }
    def.sequential_next(step_name).into_iter().collect()
}
