use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{EngineError, FlowId, RunId};

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Steps are executing
    Running,

    /// Suspended at a step boundary, waiting for a resume path
    Paused,

    /// All steps finished
    Completed,

    /// A step, predicate or fan-out failed
    Failed,

    /// Cancelled by a caller or by a cancelled parent
    Cancelled,

    /// Timed out while paused with `resume_on_timeout = false`
    Expired,
}

impl RunStatus {
    /// Whether no further transition is possible
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired
        )
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Expired)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }

    /// Lower-case name used in lifecycle event types
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Registry view of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run ID
    pub run_id: RunId,

    /// Flow definition ID
    pub flow_id: FlowId,

    /// Parent run for fan-out children
    pub parent: Option<RunId>,

    /// Current status
    pub status: RunStatus,

    /// Failure reason, when failed
    pub error: Option<String>,

    /// Completed `Paused -> Running` transitions
    #[serde(default)]
    pub resumes: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last transition timestamp
    pub updated_at: DateTime<Utc>,
}

/// Concurrent table of run statuses.
///
/// Shared by the scheduler and the resume manager; every transition is
/// validated and applied under the run's map entry lock.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, RunRecord>,
}

impl RunRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            runs: DashMap::with_capacity(64),
        }
    }

    /// Register a run as `Running`. Re-registering a terminal run is rejected.
    pub fn register(
        &self,
        run_id: RunId,
        flow_id: FlowId,
        parent: Option<RunId>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        match self.runs.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(EngineError::InvalidTransition {
                    run_id: run_id.0,
                    from: existing.get().status.to_string(),
                    to: RunStatus::Running.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RunRecord {
                    run_id,
                    flow_id,
                    parent,
                    status: RunStatus::Running,
                    error: None,
                    resumes: 0,
                    created_at: now,
                    updated_at: now,
                });
                Ok(())
            }
        }
    }

    /// Register a run recovered from persistent storage in `status`
    pub fn restore(&self, run_id: RunId, flow_id: FlowId, status: RunStatus) {
        let now = Utc::now();
        self.runs.entry(run_id.clone()).or_insert(RunRecord {
            run_id,
            flow_id,
            parent: None,
            status,
            error: None,
            resumes: 0,
            created_at: now,
            updated_at: now,
        });
    }

    /// Current status of a run
    pub fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.runs.get(run_id).map(|r| r.status)
    }

    /// Full record of a run
    pub fn record(&self, run_id: &RunId) -> Option<RunRecord> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// Apply `current -> to`, returning the previous status
    pub fn transition(&self, run_id: &RunId, to: RunStatus) -> Result<RunStatus, EngineError> {
        self.transition_with_error(run_id, to, None)
    }

    /// Transition to `Failed` and keep the reason
    pub fn fail(
        &self,
        run_id: &RunId,
        reason: impl Into<String>,
    ) -> Result<RunStatus, EngineError> {
        self.transition_with_error(run_id, RunStatus::Failed, Some(reason.into()))
    }

    fn transition_with_error(
        &self,
        run_id: &RunId,
        to: RunStatus,
        error: Option<String>,
    ) -> Result<RunStatus, EngineError> {
        let mut record = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))?;

        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                run_id: run_id.0.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        record.status = to;
        if from == RunStatus::Paused && to == RunStatus::Running {
            record.resumes += 1;
        }
        if error.is_some() {
            record.error = error;
        }
        record.updated_at = Utc::now();
        debug!(run_id = %run_id, from = %from, to = %to, "Run transition");
        Ok(from)
    }

    /// Ids of the fan-out children of `parent`
    pub fn children_of(&self, parent: &RunId) -> Vec<RunId> {
        let mut children: Vec<RunId> = self
            .runs
            .iter()
            .filter(|r| r.parent.as_ref() == Some(parent))
            .map(|r| r.run_id.clone())
            .collect();
        children.sort();
        children
    }

    /// Number of tracked runs
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no runs are tracked
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
