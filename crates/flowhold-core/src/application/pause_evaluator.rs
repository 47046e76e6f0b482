use async_trait::async_trait;
use tracing::{debug, trace};

use crate::domain::execution_context::ExecutionContext;
use crate::domain::pause::PauseCondition;
use crate::domain::step::StepDefinition;
use crate::EngineError;

/// Decides whether a run suspends before a step
///
/// Implementations are pure with respect to engine state. A pausing verdict
/// keeps the scheduler at the current step until a resume path fires.
#[async_trait]
pub trait PauseEvaluator: Send + Sync {
    /// Evaluate `step` against `context`
    async fn evaluate(
        &self,
        context: &ExecutionContext,
        step: &StepDefinition,
    ) -> Result<PauseCondition, EngineError>;
}

/// Default evaluator: runs the step's own guard, proceeds when it has none
#[derive(Debug, Default, Clone, Copy)]
pub struct StepGuardEvaluator;

#[async_trait]
impl PauseEvaluator for StepGuardEvaluator {
    async fn evaluate(
        &self,
        context: &ExecutionContext,
        step: &StepDefinition,
    ) -> Result<PauseCondition, EngineError> {
        let Some(guard) = &step.guard else {
            trace!(run_id = %context.run_id(), step_id = %step.id, "No pause guard");
            return Ok(PauseCondition::proceed());
        };

        let condition = guard.evaluate(context).await.map_err(|e| match e {
            EngineError::EvaluationError(_) => e,
            other => EngineError::EvaluationError(format!("step {}: {}", step.id, other)),
        })?;

        if condition.should_pause() {
            debug!(
                run_id = %context.run_id(),
                step_id = %step.id,
                reason = ?condition.reason(),
                "Pause guard requested suspension"
            );
        }
        Ok(condition)
    }
}
