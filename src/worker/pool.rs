//! Pooled worker: a batch of independent sub-tasks on K parallel executors.
//!
//! Every sub-task is submitted up front. Each one waits for a permit from a
//! K-permit semaphore and then runs on the blocking thread pool, so CPU-bound
//! bodies never occupy the async workers. Results are harvested one at a
//! time, with a cancellation poll before each harvest. On cancel the
//! semaphore is closed and every outstanding sub-task is aborted without
//! waiting; a body already executing on a blocking thread runs to its end
//! but its result is discarded.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{HarvestOrder, PoolConfig};
use crate::error::{SubTaskError, WorkerError, panic_message};
use crate::router::{JobType, Status};
use crate::worker::context::WorkerContext;
use crate::worker::worker::Task;

/// Data key carrying the submission index in completion-order progress.
pub const FIELD_INDEX: &str = "index";

/// One independent unit of a pooled batch.
pub trait SubTask: Send + 'static {
    type Output: Send + 'static;

    /// Run to completion on an executor thread.
    fn execute(self) -> anyhow::Result<Self::Output>;
}

impl<F, O> SubTask for F
where
    F: FnOnce() -> anyhow::Result<O> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn execute(self) -> anyhow::Result<O> {
        self()
    }
}

/// What happened to one sub-task.
#[derive(Debug)]
pub enum SubTaskOutcome<O> {
    Completed(O),
    Failed(SubTaskError),
    /// Never harvested because the batch was cancelled first.
    NotHarvested,
}

impl<O> SubTaskOutcome<O> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Per-sub-task outcomes, indexed by submission order.
#[derive(Debug)]
pub struct BatchReport<O> {
    pub outcomes: Vec<SubTaskOutcome<O>>,
    pub cancelled: bool,
}

impl<O> BatchReport<O> {
    fn new(total: usize) -> Self {
        Self {
            outcomes: (0..total).map(|_| SubTaskOutcome::NotHarvested).collect(),
            cancelled: false,
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn not_harvested(&self) -> usize {
        self.total() - self.completed() - self.failed()
    }

    /// Failures, in submission order.
    pub fn failures(&self) -> impl Iterator<Item = &SubTaskError> {
        self.outcomes.iter().filter_map(|o| match o {
            SubTaskOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Successful outputs with their submission index.
    pub fn outputs(&self) -> impl Iterator<Item = (usize, &O)> {
        self.outcomes.iter().enumerate().filter_map(|(i, o)| match o {
            SubTaskOutcome::Completed(out) => Some((i, out)),
            _ => None,
        })
    }
}

/// Tears the executor pool down when told to, or when dropped.
struct PoolGuard {
    semaphore: Arc<Semaphore>,
    aborts: Vec<AbortHandle>,
}

impl PoolGuard {
    /// Forceful shutdown: no new sub-task starts, queued ones are aborted.
    fn terminate(&self) {
        self.semaphore.close();
        for abort in &self.aborts {
            abort.abort();
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

type SubTaskHandle<O> = JoinHandle<Result<O, SubTaskError>>;

fn start_pool<S: SubTask>(
    subtasks: Vec<S>,
    executors: usize,
) -> (PoolGuard, Vec<SubTaskHandle<S::Output>>) {
    let semaphore = Arc::new(Semaphore::new(executors));
    let handles: Vec<SubTaskHandle<S::Output>> = subtasks
        .into_iter()
        .enumerate()
        .map(|(index, subtask)| {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SubTaskError::Aborted { index })?;
                let joined = tokio::task::spawn_blocking(move || subtask.execute()).await;
                match joined {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(SubTaskError::Failed {
                        index,
                        reason: format!("{e:#}"),
                    }),
                    Err(e) => Err(join_error(index, e)),
                }
            })
        })
        .collect();
    let aborts = handles.iter().map(JoinHandle::abort_handle).collect();
    (PoolGuard { semaphore, aborts }, handles)
}

fn join_error(index: usize, e: JoinError) -> SubTaskError {
    if e.is_panic() {
        SubTaskError::Panicked {
            index,
            message: panic_message(e.into_panic().as_ref()),
        }
    } else {
        SubTaskError::Aborted { index }
    }
}

fn flatten<O>(
    index: usize,
    joined: Result<Result<O, SubTaskError>, JoinError>,
) -> Result<O, SubTaskError> {
    joined.unwrap_or_else(|e| Err(join_error(index, e)))
}

/// Task that runs a batch of homogeneous sub-tasks in parallel.
pub struct PooledWorker<S: SubTask> {
    name: String,
    job_type: JobType,
    config: PoolConfig,
    subtasks: Vec<S>,
}

impl<S: SubTask> PooledWorker<S> {
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        subtasks: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            job_type,
            config: PoolConfig::default(),
            subtasks: subtasks.into_iter().collect(),
        }
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }
}

/// Harvest state borrowed for one batch run.
struct Harvester<'a> {
    ctx: &'a WorkerContext,
    guard: &'a PoolGuard,
    name: &'a str,
    job_type: &'a JobType,
    order: HarvestOrder,
}

impl Harvester<'_> {
    /// Record one harvested result and report progress for it.
    fn record<O>(
        &self,
        report: &mut BatchReport<O>,
        part: usize,
        index: usize,
        result: Result<O, SubTaskError>,
    ) {
        let total = report.total();
        let status = match result {
            Ok(output) => {
                debug!(worker = %self.name, index, part, total, "Sub-task harvested");
                report.outcomes[index] = SubTaskOutcome::Completed(output);
                Status::Ok
            }
            Err(e) => {
                warn!(worker = %self.name, index, error = %e, "Sub-task failed, continuing batch");
                let status = Status::error(e.to_string());
                report.outcomes[index] = SubTaskOutcome::Failed(e);
                status
            }
        };

        let Some(owner) = self.ctx.owner() else {
            return;
        };
        let mut extra = Map::new();
        if self.order == HarvestOrder::Completion {
            extra.insert(FIELD_INDEX.to_string(), Value::from(index));
        }
        self.ctx.report_progress_with_fields(
            owner,
            self.job_type.clone(),
            part,
            total,
            status,
            extra,
        );
    }

    /// Poll for cancellation; on a hit, tear the pool down.
    fn cancelled<O>(&self, report: &mut BatchReport<O>) -> bool {
        if self.ctx.should_exit() {
            self.guard.terminate();
            report.cancelled = true;
        }
        report.cancelled
    }

    async fn in_submission_order<O>(
        &self,
        handles: Vec<SubTaskHandle<O>>,
        report: &mut BatchReport<O>,
    ) {
        for (index, handle) in handles.into_iter().enumerate() {
            if self.cancelled(report) {
                break;
            }
            let result = flatten(index, handle.await);
            self.record(report, index, index, result);
        }
    }

    async fn in_completion_order<O>(
        &self,
        handles: Vec<SubTaskHandle<O>>,
        report: &mut BatchReport<O>,
    ) {
        let total = handles.len();
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| async move { (index, flatten(index, handle.await)) })
            .collect();

        for part in 0..total {
            if self.cancelled(report) {
                break;
            }
            let Some((index, result)) = pending.next().await else {
                break;
            };
            self.record(report, part, index, result);
        }
    }
}

#[async_trait]
impl<S: SubTask> Task for PooledWorker<S> {
    type Output = BatchReport<S::Output>;

    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn run_job(&mut self, ctx: &WorkerContext) -> Result<Self::Output, WorkerError> {
        self.config.validate().map_err(|e| WorkerError::Setup {
            worker: self.name.clone(),
            reason: e.to_string(),
        })?;

        let subtasks = std::mem::take(&mut self.subtasks);
        let total = subtasks.len();
        let mut report = BatchReport::new(total);
        if total == 0 {
            debug!(worker = %self.name, "Empty batch");
            return Ok(report);
        }

        let executors = self.config.effective_executors(total);
        let (guard, handles) = start_pool(subtasks, executors);
        ctx.mark_running()?;
        info!(
            worker = %self.name,
            total,
            executors,
            order = ?self.config.harvest_order,
            "Batch submitted"
        );

        let harvester = Harvester {
            ctx,
            guard: &guard,
            name: &self.name,
            job_type: &self.job_type,
            order: self.config.harvest_order,
        };
        match harvester.order {
            HarvestOrder::Submission => harvester.in_submission_order(handles, &mut report).await,
            HarvestOrder::Completion => harvester.in_completion_order(handles, &mut report).await,
        }

        if report.cancelled {
            info!(
                worker = %self.name,
                harvested = report.completed() + report.failed(),
                total,
                "Batch cancelled, pool terminated"
            );
        } else {
            info!(
                worker = %self.name,
                completed = report.completed(),
                failed = report.failed(),
                "Batch complete"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::router::{MailboxReceiver, ProgressUpdate, Router, RouterHandle, mailbox};
    use crate::worker::state::{LifecycleKind, RunOutcome};
    use crate::worker::worker::Worker;

    type Thunk = Box<dyn FnOnce() -> anyhow::Result<usize> + Send>;

    struct Boxed(Thunk);

    impl SubTask for Boxed {
        type Output = usize;

        fn execute(self) -> anyhow::Result<usize> {
            (self.0)()
        }
    }

    fn sleeper(i: usize, ms: u64) -> Boxed {
        Boxed(Box::new(move || -> anyhow::Result<usize> {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(i)
        }))
    }

    async fn progress_bar() -> (RouterHandle, MailboxReceiver) {
        let (router, _task) = Router::spawn();
        let (tx, rx) = mailbox();
        router.register("bar", tx).unwrap();
        (router, rx)
    }

    async fn progress(router: &RouterHandle, rx: &mut MailboxReceiver) -> Vec<ProgressUpdate> {
        router.stats().await.unwrap();
        let mut updates = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if let Some(update) = ProgressUpdate::from_envelope(&env) {
                updates.push(update);
            }
        }
        updates
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_batch_reports_ordered_progress() {
        let (router, mut rx) = progress_bar().await;
        let subtasks: Vec<Boxed> = (0..5).map(|i| sleeper(i, 100)).collect();
        let pooled = PooledWorker::new("crop", JobType::CropFaces, subtasks)
            .with_config(PoolConfig::default().with_executors(2));

        let started = Instant::now();
        let report = Worker::new(pooled, Some(router.clone()), Some("bar".into()))
            .run()
            .await;
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let batch = report.output.unwrap();
        assert_eq!(batch.completed(), 5);
        assert_eq!(batch.outputs().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let updates = progress(&router, &mut rx).await;
        assert_eq!(updates.iter().map(|u| u.part).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(updates.iter().all(|u| u.total == 5 && u.job_name == "crop"));
        assert_eq!(
            updates.iter().map(|u| u.finished).collect::<Vec<_>>(),
            vec![false, false, false, false, true]
        );

        // ceil(5/2) rounds of 100ms; serial execution would take 500ms.
        assert!(elapsed >= Duration::from_millis(280), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5 * 100), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn empty_batch_finishes_without_progress() {
        let (router, mut rx) = progress_bar().await;
        let pooled = PooledWorker::new("none", JobType::Progress, Vec::<Boxed>::new());
        let worker = Worker::new(pooled, Some(router.clone()), Some("bar".into()));
        let mut events = worker.subscribe();
        let report = worker.run().await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(progress(&router, &mut rx).await.is_empty());

        let mut finished = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev.kind, LifecycleKind::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn cancel_before_harvest_emits_no_progress() {
        let (router, mut rx) = progress_bar().await;
        let subtasks: Vec<Boxed> = (0..4).map(|i| sleeper(i, 20)).collect();
        let pooled = PooledWorker::new("landmarks", JobType::ExtractLandmarks, subtasks);
        let worker = Worker::new(pooled, Some(router.clone()), Some("bar".into()));
        worker.cancel_handle().request_cancel();
        let mut events = worker.subscribe();

        let report = worker.run().await;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        let batch = report.output.unwrap();
        assert!(batch.cancelled);
        assert_eq!(batch.not_harvested(), 4);
        assert!(progress(&router, &mut rx).await.is_empty());

        let finished = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|ev| ev.is_finished())
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_sub_task_does_not_abort_batch() {
        let (router, mut rx) = progress_bar().await;
        let subtasks: Vec<Boxed> = vec![
            sleeper(0, 1),
            Boxed(Box::new(|| -> anyhow::Result<usize> {
                anyhow::bail!("no face found")
            })),
            Boxed(Box::new(|| -> anyhow::Result<usize> { panic!("decoder crashed") })),
            sleeper(3, 1),
        ];
        let pooled = PooledWorker::new("crop", JobType::CropFaces, subtasks);
        let report = Worker::new(pooled, Some(router.clone()), Some("bar".into()))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        let batch = report.output.unwrap();
        assert_eq!(batch.completed(), 2);
        assert_eq!(batch.failed(), 2);
        let failures: Vec<_> = batch.failures().cloned().collect();
        assert!(matches!(&failures[0], SubTaskError::Failed { index: 1, reason } if reason == "no face found"));
        assert!(matches!(&failures[1], SubTaskError::Panicked { index: 2, .. }));

        let updates = progress(&router, &mut rx).await;
        assert_eq!(updates.len(), 4);
        assert!(updates[3].finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn executors_bound_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let subtasks: Vec<Boxed> = (0..8)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Boxed(Box::new(move || -> anyhow::Result<usize> {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }))
            })
            .collect();
        let pooled = PooledWorker::new("scrape", JobType::ScrapeImages, subtasks)
            .with_config(PoolConfig::default().with_executors(3));
        let report = Worker::new(pooled, None, None).run().await;

        assert_eq!(report.output.unwrap().completed(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_order_remaps_to_submission_index() {
        let (router, mut rx) = progress_bar().await;
        let subtasks = vec![sleeper(0, 200), sleeper(1, 10), sleeper(2, 10)];
        let pooled = PooledWorker::new("mri", JobType::GenerateMriDataset, subtasks).with_config(
            PoolConfig::default()
                .with_executors(3)
                .with_harvest_order(HarvestOrder::Completion),
        );
        let report = Worker::new(pooled, Some(router.clone()), Some("bar".into()))
            .run()
            .await;
        let batch = report.output.unwrap();
        assert_eq!(batch.completed(), 3);

        router.stats().await.unwrap();
        let mut parts = Vec::new();
        let mut indices = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if let Some(update) = ProgressUpdate::from_envelope(&env) {
                parts.push(update.part);
                indices.push(env.body().get(FIELD_INDEX).and_then(|v| v.as_u64()).unwrap());
            }
        }
        assert_eq!(parts, vec![0, 1, 2]);
        assert_eq!(indices.last(), Some(&0));
    }

    #[tokio::test]
    async fn invalid_config_is_setup_failure() {
        let pooled = PooledWorker::new("bad", JobType::Progress, vec![sleeper(0, 1)])
            .with_config(PoolConfig::default().with_executors(0));
        let report = Worker::new(pooled, None, None).run().await;
        assert!(report.outcome.is_failed());
        assert!(report.output.is_none());
    }

    #[tokio::test]
    async fn closures_are_sub_tasks() {
        let subtasks = (0..3).map(|i| move || -> anyhow::Result<usize> { Ok(i * 2) });
        let pooled = PooledWorker::new("double", JobType::Progress, subtasks);
        let report = Worker::new(pooled, None, None).run().await;
        let batch = report.output.unwrap();
        assert_eq!(batch.outputs().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 2, 4]);
    }
}
