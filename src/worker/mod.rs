//! Worker system: single-use background workers with cooperative cancellation.
//!
//! Core components:
//! - `state`: Lifecycle state machine (Created → Started → Running → Finished)
//! - `context`: Per-run context: cancellation queue, router handle, status
//! - `worker`: `Task` trait, `Worker` runner and `WorkerHandle`
//! - `pool`: `PooledWorker`, a batch of sub-tasks on K parallel executors
//! - `job`: `Job` descriptors and `JobSubmitter`
//! - `continuous`: `ContinuousWorker`, a long-lived job queue consumer

pub mod context;
pub mod continuous;
pub mod job;
pub mod pool;
pub mod state;
pub mod worker;

pub use context::{CancelHandle, CancelSignal, WorkerContext};
pub use continuous::{ContinuousWorker, JobHandler, ServiceReport};
pub use job::{Job, JobSubmitter};
pub use pool::{BatchReport, PooledWorker, SubTask, SubTaskOutcome};
pub use state::{LifecycleEvent, LifecycleKind, RunOutcome, WorkerState, WorkerStatus};
pub use worker::{RunReport, Task, Worker, WorkerHandle};
