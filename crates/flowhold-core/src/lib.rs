//!
//! Flowhold Core - pause/resume and dynamic branching for flow runs
//!
//! A run walks the steps of a [`FlowDefinition`]. Before each step a pause
//! guard may suspend it; the [`ResumeManager`] then brings it back exactly
//! once through manual action, an event, a polled condition or a timeout.
//! Steps configured for dynamic branching fan out into child runs at
//! runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;

/// Domain layer - state model and collaborator interfaces
pub mod domain;

/// Application services - evaluation, resumption, fan-out and scheduling
pub mod application;

/// Engine configuration
pub mod config;

/// Core types
pub mod types;

/// Error types
pub mod error;

pub use config::EngineConfig;
pub use error::EngineError;
pub use types::{DataPacket, FlowId, RunId, StepId};

pub use domain::branching::{
    AggregationPolicy, BranchItems, DynamicBranchingConfig, ExecutionStrategy,
};
pub use domain::events::{LifecycleKind, RunLifecycleEvent};
pub use domain::execution_context::{ContextSnapshot, ExecutionContext, ResumeInfo};
pub use domain::pause::{
    condition_fn, EventTrigger, PauseCondition, PauseReason, ResumeConfig, ResumeTrigger,
};
pub use domain::ports::{Clock, EventBus, EventHandler, StateStore, SystemClock};
pub use domain::run::{RunRegistry, RunStatus};
pub use domain::step::{guard_fn, BranchDefinition, FlowDefinition, StepDefinition};

pub use application::dynamic_branching::{DynamicBranchGenerator, FanOutResult};
pub use application::flow_scheduler::{FlowScheduler, RunOutcome};
pub use application::pause_evaluator::{PauseEvaluator, StepGuardEvaluator};
pub use application::resume_manager::{PauseTicket, ResumeManager, RunSignal};

/// Result of executing one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The step completed
    Success,
    /// The step failed with an error
    Failure(EngineError),
}

/// Executes the effect of a non-branching step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run `step` against the run's context
    async fn execute(&self, step: &StepDefinition, context: &mut ExecutionContext)
        -> ExecutionResult;
}
