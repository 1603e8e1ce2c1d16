//! Worker lifecycle: Started, the job body, then Finished.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{WorkerError, panic_message};
use crate::router::envelope::FIELD_JOB_NAME;
use crate::router::{Body, EndpointId, Envelope, JobType, RouterHandle};
use crate::worker::context::{CancelHandle, WorkerContext};
use crate::worker::state::{LifecycleEvent, LifecycleKind, RunOutcome, WorkerState, WorkerStatus};

/// Lifecycle events buffered per worker before slow subscribers lag.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// The unit of work a worker runs.
#[async_trait]
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    /// Worker name. Used as the sender endpoint and the progress `jobName`.
    fn name(&self) -> &str;

    /// Job type reported in this worker's envelopes.
    fn job_type(&self) -> JobType {
        JobType::Progress
    }

    /// The job body. Poll `ctx.should_exit()` between units of work and
    /// return `WorkerError::Cancelled` (or a partial output) when it is set.
    async fn run_job(&mut self, ctx: &WorkerContext) -> Result<Self::Output, WorkerError>;
}

/// Result of one worker run.
#[derive(Debug)]
pub struct RunReport<O> {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Output of the job body, if it returned one.
    pub output: Option<O>,
    pub status: WorkerStatus,
}

/// Single-use, cancellable background worker.
pub struct Worker<T: Task> {
    task: T,
    ctx: Arc<WorkerContext>,
}

impl<T: Task> Worker<T> {
    /// Create a worker. `router` is optional; without it outgoing envelopes
    /// are dropped. `owner` receives progress and the final JobExit.
    pub fn new(task: T, router: Option<RouterHandle>, owner: Option<EndpointId>) -> Self {
        let ctx = WorkerContext::new(
            task.name().to_string(),
            router,
            owner,
            DEFAULT_EVENT_CAPACITY,
        );
        Self { task, ctx }
    }

    /// Subscribe to lifecycle events. Subscribe before running to see Started.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.ctx.subscribe()
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.ctx.cancel_handle()
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Run to completion on the current task.
    ///
    /// Emits exactly one Started and one Finished event, whatever the job
    /// body does (including panicking).
    pub async fn run(mut self) -> RunReport<T::Output> {
        let ctx = Arc::clone(&self.ctx);
        let run_id = ctx.run_id();

        if let Err(e) = ctx.transition(WorkerState::Started) {
            // Only reachable if the context was shared and already run.
            tracing::error!(worker = %ctx.name(), error = %e, "Worker cannot start");
            return RunReport {
                run_id,
                outcome: RunOutcome::Failed {
                    reason: e.to_string(),
                },
                output: None,
                status: ctx.status(),
            };
        }
        ctx.emit(LifecycleKind::Started);
        tracing::info!(worker = %ctx.name(), run_id = %run_id, "Worker started");

        let result = AssertUnwindSafe(self.task.run_job(&ctx))
            .catch_unwind()
            .await;

        let (outcome, output) = match result {
            Ok(Ok(output)) if ctx.exit_requested() => (RunOutcome::Cancelled, Some(output)),
            Ok(Ok(output)) => (RunOutcome::Completed, Some(output)),
            Ok(Err(WorkerError::Cancelled { .. })) => (RunOutcome::Cancelled, None),
            Ok(Err(e)) => {
                tracing::error!(worker = %ctx.name(), error = %e, "Worker job failed");
                (
                    RunOutcome::Failed {
                        reason: e.to_string(),
                    },
                    None,
                )
            }
            Err(payload) => {
                let e = WorkerError::Panicked {
                    worker: ctx.name().to_string(),
                    message: panic_message(payload.as_ref()),
                };
                tracing::error!(worker = %ctx.name(), error = %e, "Worker job panicked");
                (
                    RunOutcome::Failed {
                        reason: e.to_string(),
                    },
                    None,
                )
            }
        };

        if let Err(e) = ctx.finish(outcome.clone()) {
            tracing::warn!(worker = %ctx.name(), error = %e, "Unexpected state at finish");
        }
        self.send_job_exit(&outcome);
        ctx.emit(LifecycleKind::Finished {
            outcome: outcome.clone(),
        });

        let status = ctx.status();
        tracing::info!(
            worker = %ctx.name(),
            run_id = %run_id,
            outcome = ?outcome,
            elapsed_ms = status.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
            "Worker finished"
        );

        RunReport {
            run_id,
            outcome,
            output,
            status,
        }
    }

    /// Run on a dedicated task so the caller never blocks.
    pub fn spawn(self) -> WorkerHandle<T::Output> {
        let ctx = Arc::clone(&self.ctx);
        let join = tokio::spawn(self.run());
        WorkerHandle { ctx, join }
    }

    fn send_job_exit(&self, outcome: &RunOutcome) {
        let Some(owner) = self.ctx.owner() else {
            return;
        };
        let body = Body::new(self.task.job_type())
            .with_field(FIELD_JOB_NAME, self.ctx.name())
            .with_field("cancelled", matches!(outcome, RunOutcome::Cancelled));
        self.ctx.send_message(Envelope::job_exit(
            self.ctx.endpoint().clone(),
            owner.clone(),
            outcome.status(),
            body,
        ));
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle<O> {
    ctx: Arc<WorkerContext>,
    join: JoinHandle<RunReport<O>>,
}

impl<O> WorkerHandle<O> {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.ctx.request_cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.ctx.cancel_handle()
    }

    pub fn state(&self) -> WorkerState {
        self.ctx.state()
    }

    pub fn status(&self) -> WorkerStatus {
        self.ctx.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.ctx.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<RunReport<O>, WorkerError> {
        let worker = self.ctx.name().to_string();
        self.join.await.map_err(|e| WorkerError::Panicked {
            worker,
            message: e.to_string(),
        })
    }
}
