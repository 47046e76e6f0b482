/// Pause guard evaluation
pub mod pause_evaluator;

/// Pause registration and exactly-once resumption
pub mod resume_manager;

/// Runtime fan-out into child runs
pub mod dynamic_branching;

/// Step walking, pause re-entry and cancellation
pub mod flow_scheduler;
