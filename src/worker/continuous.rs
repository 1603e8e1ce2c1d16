//! Continuous worker: services a queue of jobs until told to stop.
//!
//! Jobs are taken one at a time in arrival order, each run to completion
//! before the next dequeue. A failing or panicking job is logged and the
//! loop carries on. The dequeue wait is bounded so cancellation is polled
//! even when the queue is idle. On cancel the queue is closed and every job
//! still waiting in it is answered as cancelled instead of run.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ContinuousConfig;
use crate::error::{WorkerError, panic_message};
use crate::router::envelope::FIELD_JOB_NAME;
use crate::router::{Body, Envelope, JobType, Status};
use crate::worker::context::WorkerContext;
use crate::worker::job::{CurrentJob, Job, JobSubmitter, lock_current};
use crate::worker::worker::{Task, Worker};

/// Data key carrying the job id in per-job answers.
pub const FIELD_JOB_ID: &str = "jobId";

/// Executes one dequeued job.
#[async_trait]
pub trait JobHandler: Send + 'static {
    async fn handle(&mut self, job: &Job, ctx: &WorkerContext) -> Result<(), WorkerError>;
}

/// Counters returned when the service loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub processed: u64,
    pub failed: u64,
    /// Queued jobs answered as cancelled without running.
    pub discarded: u64,
}

/// Task that consumes [`Job`]s from its queue.
pub struct ContinuousWorker<H: JobHandler> {
    name: String,
    job_type: JobType,
    handler: H,
    config: ContinuousConfig,
    tx: Option<mpsc::UnboundedSender<Job>>,
    rx: mpsc::UnboundedReceiver<Job>,
    current: CurrentJob,
}

impl<H: JobHandler> ContinuousWorker<H> {
    pub fn new(name: impl Into<String>, job_type: JobType, handler: H) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            job_type,
            handler,
            config: ContinuousConfig::default(),
            tx: Some(tx),
            rx,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_config(mut self, config: ContinuousConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    async fn service(&mut self, job: Job, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let id = job.id;
        debug!(worker = %self.name, job_id = %id, "Servicing job");
        *lock_current(&self.current) = Some(job.clone());

        let result = AssertUnwindSafe(self.handler.handle(&job, ctx))
            .catch_unwind()
            .await;
        *lock_current(&self.current) = None;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ WorkerError::JobFailed { .. })) => Err(e),
            Ok(Err(e)) => Err(WorkerError::JobFailed {
                id,
                reason: e.to_string(),
            }),
            Err(payload) => Err(WorkerError::Panicked {
                worker: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    fn answer(&self, ctx: &WorkerContext, job: &Job, status: Status) {
        let Some(owner) = ctx.owner() else {
            return;
        };
        let body = Body::new(self.job_type.clone())
            .with_field(FIELD_JOB_NAME, self.name.as_str())
            .with_field(FIELD_JOB_ID, job.id.to_string());
        ctx.send_message(Envelope::answer(
            ctx.endpoint().clone(),
            owner.clone(),
            status,
            body,
        ));
    }

    /// Close the queue and answer every job left in it as cancelled.
    fn discard_pending(&mut self, ctx: &WorkerContext) -> u64 {
        self.rx.close();
        let mut discarded = 0;
        while let Ok(job) = self.rx.try_recv() {
            debug!(worker = %self.name, job_id = %job.id, "Discarding queued job");
            self.answer(ctx, &job, Status::error("cancelled"));
            discarded += 1;
        }
        if discarded > 0 {
            warn!(worker = %self.name, discarded, "Queued jobs discarded on cancel");
        }
        discarded
    }
}

impl<H: JobHandler> Worker<ContinuousWorker<H>> {
    /// Producer handle for this worker's queue. Take one before spawning.
    pub fn submitter(&self) -> Result<JobSubmitter, WorkerError> {
        let task = self.task();
        let tx = task.tx.clone().ok_or_else(|| WorkerError::QueueClosed {
            worker: task.name.clone(),
        })?;
        Ok(JobSubmitter::new(
            task.name.clone(),
            tx,
            self.cancel_handle(),
            Arc::clone(&task.current),
        ))
    }
}

#[async_trait]
impl<H: JobHandler> Task for ContinuousWorker<H> {
    type Output = ServiceReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn run_job(&mut self, ctx: &WorkerContext) -> Result<ServiceReport, WorkerError> {
        self.config.validate().map_err(|e| WorkerError::Setup {
            worker: self.name.clone(),
            reason: e.to_string(),
        })?;
        // Only external submitters keep the queue open from here on.
        self.tx = None;
        ctx.mark_running()?;
        info!(
            worker = %self.name,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Service loop started"
        );

        let mut report = ServiceReport::default();
        loop {
            // Poll point: between jobs and after every idle wait.
            if ctx.should_exit() {
                info!(worker = %self.name, "Cancellation requested, leaving service loop");
                report.discarded = self.discard_pending(ctx);
                break;
            }

            let job = match tokio::time::timeout(self.config.poll_interval, self.rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    info!(worker = %self.name, "All submitters gone and queue drained");
                    break;
                }
                Err(_) => continue,
            };

            match self.service(job.clone(), ctx).await {
                Ok(()) => {
                    report.processed += 1;
                    self.answer(ctx, &job, Status::Ok);
                }
                Err(e) => {
                    report.failed += 1;
                    if matches!(e, WorkerError::Panicked { .. }) {
                        error!(worker = %self.name, job_id = %job.id, error = %e, "Job panicked, continuing");
                    } else {
                        warn!(worker = %self.name, job_id = %job.id, error = %e, "Job failed, continuing");
                    }
                    self.answer(ctx, &job, Status::error(e.to_string()));
                }
            }
        }

        info!(
            worker = %self.name,
            processed = report.processed,
            failed = report.failed,
            discarded = report.discarded,
            "Service loop stopped"
        );
        Ok(report)
    }
}
