//! Per-run worker context handed to job bodies.
//!
//! Holds the cancellation queue, the router handle used for outgoing
//! envelopes, and the run's status record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::router::{Body, EndpointId, Envelope, JobType, RouterHandle, Status};
use crate::worker::state::{LifecycleEvent, LifecycleKind, RunOutcome, WorkerState, WorkerStatus};

/// Sentinel pushed into a worker's cancellation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelSignal;

/// Requests cancellation of a worker from any thread or task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::UnboundedSender<CancelSignal>,
}

impl CancelHandle {
    /// Enqueue a cancellation sentinel. Returns false if the worker is gone.
    pub fn request_cancel(&self) -> bool {
        self.tx.send(CancelSignal).is_ok()
    }
}

/// Context for a running worker.
pub struct WorkerContext {
    name: String,
    endpoint: EndpointId,
    owner: Option<EndpointId>,
    router: Option<RouterHandle>,
    cancel_tx: mpsc::UnboundedSender<CancelSignal>,
    cancel_rx: Mutex<mpsc::UnboundedReceiver<CancelSignal>>,
    exit_requested: AtomicBool,
    status: Mutex<WorkerStatus>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl WorkerContext {
    pub(crate) fn new(
        name: String,
        router: Option<RouterHandle>,
        owner: Option<EndpointId>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            endpoint: EndpointId::new(name.clone()),
            status: Mutex::new(WorkerStatus::new(name.clone())),
            name,
            owner,
            router,
            cancel_tx,
            cancel_rx: Mutex::new(cancel_rx),
            exit_requested: AtomicBool::new(false),
            events,
        })
    }

    /// Worker name, also used as the `jobName` of progress envelopes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint id this worker sends from.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Endpoint that receives this worker's progress and exit envelopes.
    pub fn owner(&self) -> Option<&EndpointId> {
        self.owner.as_ref()
    }

    pub fn router(&self) -> Option<&RouterHandle> {
        self.router.as_ref()
    }

    pub fn run_id(&self) -> Uuid {
        self.lock_status().run_id
    }

    pub fn state(&self) -> WorkerState {
        self.lock_status().state
    }

    /// Copy of the run's status record.
    pub fn status(&self) -> WorkerStatus {
        self.lock_status().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Enqueue a cancellation sentinel.
    pub fn request_cancel(&self) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.cancel_tx.send(CancelSignal);
    }

    /// Non-suspending cancellation poll.
    ///
    /// Consumes a pending sentinel if there is one. Once a sentinel has been
    /// seen the answer stays true for the rest of the run. The queue lock is
    /// held only for a `try_recv` and the latch store, so concurrent pollers
    /// wait at most for that and never miss a sentinel another poller took.
    pub fn should_exit(&self) -> bool {
        if self.exit_requested.load(Ordering::Acquire) {
            return true;
        }
        let mut rx = self.cancel_rx.lock().unwrap_or_else(|e| e.into_inner());
        if self.exit_requested.load(Ordering::Acquire) {
            return true;
        }
        if rx.try_recv().is_err() {
            return false;
        }
        // Latch before the guard is released.
        self.exit_requested.store(true, Ordering::Release);
        drop(rx);
        debug!(worker = %self.name, "Cancellation observed");
        true
    }

    /// Whether a cancellation has been observed by `should_exit` this run.
    /// Does not touch the queue.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Forward an envelope to the router. No-op without a router.
    pub fn send_message(&self, envelope: Envelope) {
        let Some(router) = &self.router else {
            return;
        };
        if let Err(e) = router.send(envelope) {
            warn!(worker = %self.name, error = %e, "Failed to send envelope");
        }
    }

    /// Send a progress answer for `part` of `total` to `owner`.
    pub fn report_progress(&self, owner: &EndpointId, job_type: JobType, part: usize, total: usize) {
        self.report_progress_with_status(owner, job_type, part, total, Status::Ok);
    }

    /// Progress answer carrying an explicit status, used when the unit of
    /// work behind this step failed but the run continues.
    pub fn report_progress_with_status(
        &self,
        owner: &EndpointId,
        job_type: JobType,
        part: usize,
        total: usize,
        status: Status,
    ) {
        self.report_progress_with_fields(owner, job_type, part, total, status, Map::new());
    }

    /// Progress answer with extra data fields appended after the standard
    /// `part`, `total` and `jobName`.
    pub fn report_progress_with_fields(
        &self,
        owner: &EndpointId,
        job_type: JobType,
        part: usize,
        total: usize,
        status: Status,
        extra: Map<String, Value>,
    ) {
        let mut body = Body::progress(job_type, &self.name, part, total);
        body.data.extend(extra);
        self.send_message(Envelope::answer(
            self.endpoint.clone(),
            owner.clone(),
            status,
            body,
        ));
    }

    /// Optional Started -> Running transition once setup is complete.
    pub fn mark_running(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Running)?;
        self.emit(LifecycleKind::Running);
        Ok(())
    }

    pub(crate) fn transition(&self, state: WorkerState) -> Result<(), WorkerError> {
        self.lock_status().transition_to(state)
    }

    pub(crate) fn finish(&self, outcome: RunOutcome) -> Result<(), WorkerError> {
        self.lock_status().finish(outcome)
    }

    pub(crate) fn emit(&self, kind: LifecycleKind) {
        let event = LifecycleEvent {
            run_id: self.run_id(),
            worker: self.name.clone(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ProgressUpdate, Router, mailbox};

    fn ctx(router: Option<RouterHandle>) -> Arc<WorkerContext> {
        WorkerContext::new("landmarks".into(), router, Some("bar".into()), 8)
    }

    #[test]
    fn fresh_context_should_not_exit() {
        assert!(!ctx(None).should_exit());
    }

    #[test]
    fn should_exit_is_immediate_after_request() {
        let ctx = ctx(None);
        ctx.request_cancel();
        assert!(ctx.should_exit());
    }

    #[test]
    fn cancellation_latches_after_first_observation() {
        let ctx = ctx(None);
        ctx.cancel_handle().request_cancel();
        assert!(ctx.should_exit());
        assert!(ctx.should_exit());
    }

    #[test]
    fn cancel_handle_works_from_another_thread() {
        let ctx = ctx(None);
        let handle = ctx.cancel_handle();
        std::thread::spawn(move || handle.request_cancel())
            .join()
            .unwrap();
        assert!(ctx.should_exit());
    }

    #[test]
    fn concurrent_pollers_all_observe_one_cancel() {
        let ctx = ctx(None);
        ctx.request_cancel();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let pollers: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ctx.should_exit()
                })
            })
            .collect();
        for poller in pollers {
            assert!(poller.join().unwrap());
        }
    }

    #[test]
    fn send_without_router_is_noop() {
        let ctx = ctx(None);
        ctx.report_progress(&"bar".into(), JobType::Progress, 0, 1);
    }

    #[tokio::test]
    async fn extra_progress_fields_follow_standard_ones() {
        let (router, _task) = Router::spawn();
        let (tx, mut rx) = mailbox();
        router.register("bar", tx).unwrap();

        let ctx = ctx(Some(router));
        let mut extra = Map::new();
        extra.insert("index".into(), Value::from(7));
        ctx.report_progress_with_fields(
            &"bar".into(),
            JobType::CropFaces,
            0,
            3,
            Status::error("no face"),
            extra,
        );

        let env = rx.recv().await.unwrap();
        let keys: Vec<&str> = env.body().data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["part", "total", "jobName", "index"]);
        assert_eq!(env.status(), Some(&Status::error("no face")));
        assert_eq!(ProgressUpdate::from_envelope(&env).unwrap().job_name, "landmarks");
    }

    #[test]
    fn mark_running_requires_started() {
        let ctx = ctx(None);
        assert!(ctx.mark_running().is_err());
        ctx.transition(WorkerState::Started).unwrap();
        ctx.mark_running().unwrap();
        assert_eq!(ctx.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn report_progress_reaches_owner() {
        let (router, _task) = Router::spawn();
        let (tx, mut rx) = mailbox();
        router.register("bar", tx).unwrap();

        let ctx = ctx(Some(router));
        ctx.report_progress(&"bar".into(), JobType::ExtractLandmarks, 1, 2);

        let env = rx.recv().await.unwrap();
        assert_eq!(env.sender().as_str(), "landmarks");
        let update = ProgressUpdate::from_envelope(&env).unwrap();
        assert_eq!(update.part, 1);
        assert_eq!(update.total, 2);
        assert!(update.finished);
    }
}
