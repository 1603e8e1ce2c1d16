//! Job descriptors and the submitting side of a continuous worker's queue.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::worker::context::CancelHandle;

/// One unit of work for a continuous worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Named fields, in insertion order, interpreted by the job handler.
    pub data: Map<String, Value>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            data: Map::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot holding the job currently being serviced.
pub(crate) type CurrentJob = Arc<Mutex<Option<Job>>>;

pub(crate) fn lock_current(current: &CurrentJob) -> MutexGuard<'_, Option<Job>> {
    current.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cloneable producer handle for a continuous worker.
///
/// The worker stops on its own once every submitter is dropped and the
/// queue has drained.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    worker: String,
    tx: mpsc::UnboundedSender<Job>,
    cancel: CancelHandle,
    current: CurrentJob,
}

impl JobSubmitter {
    pub(crate) fn new(
        worker: String,
        tx: mpsc::UnboundedSender<Job>,
        cancel: CancelHandle,
        current: CurrentJob,
    ) -> Self {
        Self {
            worker,
            tx,
            cancel,
            current,
        }
    }

    /// Enqueue a job. Fails once the worker has finished.
    pub fn submit(&self, job: Job) -> Result<Uuid, WorkerError> {
        let id = job.id;
        self.tx.send(job).map_err(|_| WorkerError::QueueClosed {
            worker: self.worker.clone(),
        })?;
        Ok(id)
    }

    /// Ask the worker to stop at its next poll point.
    pub fn request_cancel(&self) -> bool {
        self.cancel.request_cancel()
    }

    /// Copy of the job being serviced right now, if any.
    pub fn current_job(&self) -> Option<Job> {
        lock_current(&self.current).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
