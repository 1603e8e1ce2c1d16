//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::router::Status;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Constructed, not yet run.
    Created,
    /// `run` was called and the Started event emitted.
    Started,
    /// Setup is complete and the main work loop has begun.
    Running,
    /// Terminal. The worker cannot be run again.
    Finished,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Created, Started) | (Started, Running) | (Started, Finished) | (Running, Finished)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Running => "running",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
}

impl RunOutcome {
    /// Status carried by the run's JobExit envelope.
    pub fn status(&self) -> Status {
        match self {
            Self::Completed | Self::Cancelled => Status::Ok,
            Self::Failed { reason } => Status::error(reason.clone()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
}

/// What a lifecycle event reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Running,
    Finished { outcome: RunOutcome },
}

/// Broadcast to subscribers at each lifecycle edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub run_id: Uuid,
    pub worker: String,
    pub kind: LifecycleKind,
}

impl LifecycleEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, LifecycleKind::Finished { .. })
    }
}

/// Status snapshot of one worker run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub run_id: Uuid,
    pub worker: String,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub transitions: Vec<StateTransition>,
}

impl WorkerStatus {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            worker: worker.into(),
            state: WorkerState::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(new_state) {
            return Err(WorkerError::InvalidTransition {
                worker: self.worker.clone(),
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
        });
        self.state = new_state;

        match new_state {
            WorkerState::Started => self.started_at = Some(Utc::now()),
            WorkerState::Finished => self.finished_at = Some(Utc::now()),
            _ => {}
        }

        Ok(())
    }

    /// Move to Finished and record the outcome.
    pub fn finish(&mut self, outcome: RunOutcome) -> Result<(), WorkerError> {
        self.transition_to(WorkerState::Finished)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Duration from start to finish (or now, if still running).
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or_default()
        })
    }
}
