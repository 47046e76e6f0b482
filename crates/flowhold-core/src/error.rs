use thiserror::Error;

/// Core error type for the flowhold engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A pause was registered with no way to resume it
    #[error("Invalid resume configuration: {0}")]
    InvalidResumeConfig(String),

    /// A parallel fan-out was requested over an unbounded item source
    #[error("Unbounded parallel fan-out: {0}")]
    UnboundedParallelFanout(String),

    /// Manual resume attempted without a permitted role
    #[error("Unauthorized resume of run {run_id}: {reason}")]
    Unauthorized {
        /// Run the actor tried to resume
        run_id: String,
        /// Why the attempt was rejected
        reason: String,
    },

    /// Another resume path won the race for this run
    #[error("Run already resumed: {0}")]
    AlreadyResumed(String),

    /// The run has no armed pause
    #[error("Run is not paused: {0}")]
    RunNotPaused(String),

    /// Run not found
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowNotFound(String),

    /// Illegal lifecycle edge
    #[error("Invalid run transition for {run_id}: {from} -> {to}")]
    InvalidTransition {
        /// Run being transitioned
        run_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The pause evaluator failed
    #[error("Pause evaluation error: {0}")]
    EvaluationError(String),

    /// A resume predicate or event filter failed
    #[error("Predicate error: {0}")]
    PredicateError(String),

    /// Step execution error
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Event bus error
    #[error("Event bus error: {0}")]
    EventBusError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Definition errors are fatal and are rejected when a pause or fan-out
    /// is registered, never at resume time.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidResumeConfig(_) | EngineError::UnboundedParallelFanout(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::ConfigurationError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
