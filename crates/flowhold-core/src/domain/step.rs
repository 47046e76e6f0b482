use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::branching::DynamicBranchingConfig;
use super::execution_context::ExecutionContext;
use super::pause::PauseCondition;
use crate::{EngineError, FlowId, StepId};

/// Pause guard attached to a step, evaluated before the step's effect runs
#[async_trait]
pub trait StepGuard: Send + Sync {
    /// Decide whether the run must suspend before this step
    async fn evaluate(&self, context: &ExecutionContext) -> Result<PauseCondition, EngineError>;
}

struct GuardFn<F>(F);

#[async_trait]
impl<F> StepGuard for GuardFn<F>
where
    F: Fn(&ExecutionContext) -> Result<PauseCondition, EngineError> + Send + Sync,
{
    async fn evaluate(&self, context: &ExecutionContext) -> Result<PauseCondition, EngineError> {
        (self.0)(context)
    }
}

/// Wrap a synchronous closure as a step guard
pub fn guard_fn<F>(f: F) -> Arc<dyn StepGuard>
where
    F: Fn(&ExecutionContext) -> Result<PauseCondition, EngineError> + Send + Sync + 'static,
{
    Arc::new(GuardFn(f))
}

/// One unit of work in a flow's static graph
#[derive(Clone)]
pub struct StepDefinition {
    /// Step ID
    pub id: StepId,

    /// Optional pause guard
    pub guard: Option<Arc<dyn StepGuard>>,

    /// Runtime fan-out replacing the step's own effect
    pub dynamic_branching: Option<DynamicBranchingConfig>,

    /// Configuration handed to the step executor
    pub config: HashMap<String, Value>,
}

impl StepDefinition {
    /// Create a plain step
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: StepId(id.into()),
            guard: None,
            dynamic_branching: None,
            config: HashMap::new(),
        }
    }

    /// Attach a pause guard
    pub fn with_guard(mut self, guard: Arc<dyn StepGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Expand this step into dynamic branches
    pub fn with_dynamic_branching(mut self, config: DynamicBranchingConfig) -> Self {
        self.dynamic_branching = Some(config);
        self
    }

    /// Add a configuration entry
    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    /// Whether the step fans out
    #[inline]
    pub fn is_fan_out(&self) -> bool {
        self.dynamic_branching.is_some()
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("guarded", &self.guard.is_some())
            .field("dynamic_branching", &self.dynamic_branching)
            .field("config", &self.config)
            .finish()
    }
}

/// Ordered list of steps executed by one dynamic branch
#[derive(Debug, Clone)]
pub struct BranchDefinition {
    /// Steps of the branch
    pub steps: Vec<StepDefinition>,
}

impl BranchDefinition {
    /// Branch running `steps` in order
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self { steps }
    }

    /// Branch made of a single step
    pub fn single(step: StepDefinition) -> Self {
        Self { steps: vec![step] }
    }
}

/// Static step graph of a flow
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    /// Flow ID
    pub id: FlowId,

    /// Top-level steps in execution order
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    /// Create an empty flow
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: FlowId(id.into()),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Step at `index`
    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    /// Position of a step by id
    pub fn position(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == step_id)
    }

    /// Reject empty flows and duplicate step ids
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::ConfigurationError(format!(
                "Flow {} has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(EngineError::ConfigurationError(format!(
                    "Flow {} declares step {} twice",
                    self.id, step.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pause::{PauseReason, ResumeConfig};
    use crate::{DataPacket, RunId};
    use serde_json::json;

    #[test]
    fn test_flow_builder_and_lookup() {
        let flow = FlowDefinition::new("onboarding")
            .with_step(StepDefinition::new("collect").with_config("form", json!("kyc")))
            .with_step(StepDefinition::new("review"));

        assert_eq!(flow.id, FlowId::from("onboarding"));
        assert_eq!(flow.position(&StepId::from("review")), Some(1));
        assert_eq!(flow.step(0).unwrap().config["form"], json!("kyc"));
        assert!(flow.step(2).is_none());
        tokio_test::assert_ok!(flow.validate());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        let empty = FlowDefinition::new("empty");
        let err = tokio_test::assert_err!(empty.validate());
        assert!(matches!(err, EngineError::ConfigurationError(_)));

        let dup = FlowDefinition::new("dup")
            .with_step(StepDefinition::new("a"))
            .with_step(StepDefinition::new("a"));
        match dup.validate() {
            Err(EngineError::ConfigurationError(msg)) => assert!(msg.contains("twice")),
            other => panic!("Expected ConfigurationError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guard_fn_evaluates_against_context() {
        let guard = guard_fn(|ctx| {
            if ctx.get("approved").is_some() {
                Ok(PauseCondition::proceed())
            } else {
                Ok(PauseCondition::pause(
                    PauseReason::AwaitingApproval,
                    "approval required",
                    DataPacket::null(),
                    ResumeConfig::new().allow_manual(["approver"]),
                ))
            }
        });

        let mut ctx = ExecutionContext::new(RunId::from("r"), FlowId::from("f"));
        assert!(guard.evaluate(&ctx).await.unwrap().should_pause());
        ctx.set("approved", DataPacket::new(json!(true)));
        assert!(!guard.evaluate(&ctx).await.unwrap().should_pause());
    }
}
