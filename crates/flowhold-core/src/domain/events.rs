use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use super::run::RunStatus;
use crate::{DataPacket, EngineError, FlowId, RunId, StepId};

/// Domain event trait for run lifecycle notifications
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the run this event is associated with
    fn run_id(&self) -> &RunId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Lifecycle transition being announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// Run suspended at a step
    Paused,
    /// Run brought back by a resume path
    Resumed,
    /// Run finished every step
    Completed,
    /// Run failed
    Failed,
    /// Run cancelled
    Cancelled,
    /// Run timed out while paused
    Expired,
}

impl LifecycleKind {
    /// Every kind, in lifecycle order
    pub const ALL: [LifecycleKind; 6] = [
        LifecycleKind::Paused,
        LifecycleKind::Resumed,
        LifecycleKind::Completed,
        LifecycleKind::Failed,
        LifecycleKind::Cancelled,
        LifecycleKind::Expired,
    ];

    /// Event type published on the bus
    pub fn event_type(self) -> &'static str {
        match self {
            LifecycleKind::Paused => "flow_run.paused",
            LifecycleKind::Resumed => "flow_run.resumed",
            LifecycleKind::Completed => "flow_run.completed",
            LifecycleKind::Failed => "flow_run.failed",
            LifecycleKind::Cancelled => "flow_run.cancelled",
            LifecycleKind::Expired => "flow_run.expired",
        }
    }

    /// Kind for a published event type
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_type() == event_type)
    }
}

/// Event: a run changed lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLifecycleEvent {
    /// Transition announced
    pub kind: LifecycleKind,

    /// The run
    pub run_id: RunId,

    /// Flow definition of the run
    pub flow_id: FlowId,

    /// Step the run was at, when relevant
    pub step_id: Option<StepId>,

    /// Status after the transition
    pub status: RunStatus,

    /// Failure reason or resume path
    pub detail: Option<String>,

    /// The timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

impl RunLifecycleEvent {
    /// Create an event stamped now
    pub fn new(kind: LifecycleKind, run_id: RunId, flow_id: FlowId, status: RunStatus) -> Self {
        Self {
            kind,
            run_id,
            flow_id,
            step_id: None,
            status,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the step
    pub fn at_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Attach a detail string
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Bus payload for this event
    pub fn to_packet(&self) -> Result<DataPacket, EngineError> {
        Ok(DataPacket::from(self)?)
    }

    /// Decode a bus payload
    pub fn from_packet(packet: &DataPacket) -> Result<Self, EngineError> {
        Ok(packet.to()?)
    }
}

impl DomainEvent for RunLifecycleEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
