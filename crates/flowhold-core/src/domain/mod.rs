/// Execution context and snapshots
pub mod execution_context;

/// Pause conditions and resume configuration
pub mod pause;

/// Run lifecycle
pub mod run;

/// Flow and step definitions
pub mod step;

/// Dynamic branching configuration
pub mod branching;

/// Domain events
pub mod events;

/// Collaborator interfaces
pub mod ports;
