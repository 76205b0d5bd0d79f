//! Database-agnostic engine for a durable, multi-tenant job queue: the
//! claim/execute/finalize cycle, retry and backoff, dedup and idempotency,
//! sequential ordering, leader-elected periodic scheduling, and workflow
//! orchestration. Every module here depends only on [`store::Store`] -
//! nothing in this crate knows which database or driver backs it.

pub mod cancel;
pub mod error;
pub mod facade;
pub mod leader;
pub mod model;
pub mod periodic;
pub mod processor;
pub mod rescuer;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod worker;
pub mod workflow;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
mod stress_tests;

pub use cancel::{with_timeout, CancelToken};
pub use error::{QueueError, Result};
pub use facade::{Facade, FacadeOptions, WorkOptions};
pub use leader::{LeaderElection, LeaderElectionOptions};
pub use model::{
    cmp_claim_order, Job, JobErrorEntry, JobStatus, NewJob, PeriodicState, Queue, QueueSpec, RetryPolicy, Workflow,
    WorkflowStatus,
};
pub use periodic::{CatchUpStrategy, PeriodicDefinition, PeriodicEngine};
pub use processor::{Handler, JobContext, JobProcessor, OnJobFailed, OnJobProcessed, ProcessorOptions};
pub use rescuer::{Rescuer, RescuerOptions};
pub use scheduler::Scheduler;
pub use store::{Store, StoreSession};
pub use tracker::ExecutionTracker;
pub use worker::{Worker, WorkerOptions};
pub use workflow::{NextSpec, StepHandler, StepNames, WorkflowDefinition, WorkflowEngine, WorkflowStep};
