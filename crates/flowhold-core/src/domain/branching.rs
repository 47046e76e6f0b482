//! Dynamic branching configuration
//!
//! Describes how one step expands at runtime into a set of sub-branches.
//! Execution lives in [`crate::application::dynamic_branching`].

use futures::stream::{self, BoxStream};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::execution_context::ExecutionContext;
use super::step::BranchDefinition;
use crate::{DataPacket, EngineError};

/// Default upper bound on simultaneously active sub-branches
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Items produced by a data selector
pub enum BranchItems {
    /// Finite, enumerable items
    Finite(Vec<DataPacket>),
    /// Lazily produced, possibly endless items; sequential strategy only
    Unbounded(BoxStream<'static, DataPacket>),
}

impl BranchItems {
    /// Finite items from JSON values
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        BranchItems::Finite(values.into_iter().map(DataPacket::new).collect())
    }

    /// Whether the source is finite
    pub fn is_finite(&self) -> bool {
        matches!(self, BranchItems::Finite(_))
    }

    /// View the items as a stream, preserving order
    pub fn into_stream(self) -> BoxStream<'static, DataPacket> {
        match self {
            BranchItems::Finite(items) => Box::pin(stream::iter(items)),
            BranchItems::Unbounded(items) => items,
        }
    }
}

impl fmt::Debug for BranchItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchItems::Finite(items) => f.debug_tuple("Finite").field(&items.len()).finish(),
            BranchItems::Unbounded(_) => f.write_str("Unbounded"),
        }
    }
}

/// Produces the items to fan out over
pub type DataSelector =
    Arc<dyn Fn(&ExecutionContext) -> Result<BranchItems, EngineError> + Send + Sync>;

/// Builds the sub-branch for one item and its index
pub type BranchFactory = Arc<dyn Fn(&DataPacket, usize) -> BranchDefinition + Send + Sync>;

/// How sub-branches are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Bounded-concurrency batches
    Parallel,
    /// One at a time, in index order
    Sequential,
}

/// How child outcomes decide the parent step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationPolicy {
    /// The first failing branch aborts the rest and fails the step
    #[default]
    AbortOnFirstFailure,
    /// Every branch runs; failures are recorded per item
    BestEffort,
}

/// Runtime fan-out for one step
#[derive(Clone)]
pub struct DynamicBranchingConfig {
    /// Item source
    pub data_selector: DataSelector,
    /// Per-item branch builder
    pub branch_factory: BranchFactory,
    /// Scheduling strategy
    pub execution_strategy: ExecutionStrategy,
    /// Upper bound on active branches for the parallel strategy
    pub max_concurrency: usize,
    /// Pause inserted between parallel batches
    pub batch_delay: Duration,
    /// Failure handling
    pub aggregation: AggregationPolicy,
    /// Variable receiving the aggregated results; defaults to the step id
    pub output_key: Option<String>,
}

impl DynamicBranchingConfig {
    /// Parallel fan-out with default concurrency and no batch delay
    pub fn new<S, F>(data_selector: S, branch_factory: F) -> Self
    where
        S: Fn(&ExecutionContext) -> Result<BranchItems, EngineError> + Send + Sync + 'static,
        F: Fn(&DataPacket, usize) -> BranchDefinition + Send + Sync + 'static,
    {
        Self {
            data_selector: Arc::new(data_selector),
            branch_factory: Arc::new(branch_factory),
            execution_strategy: ExecutionStrategy::Parallel,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            batch_delay: Duration::ZERO,
            aggregation: AggregationPolicy::default(),
            output_key: None,
        }
    }

    /// Use the sequential strategy
    pub fn sequential(mut self) -> Self {
        self.execution_strategy = ExecutionStrategy::Sequential;
        self
    }

    /// Use the parallel strategy
    pub fn parallel(mut self) -> Self {
        self.execution_strategy = ExecutionStrategy::Parallel;
        self
    }

    /// Bound simultaneously active branches
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sleep between parallel batches
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Run every branch regardless of failures
    pub fn best_effort(mut self) -> Self {
        self.aggregation = AggregationPolicy::BestEffort;
        self
    }

    /// Store aggregated results under `key`
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }
}

impl fmt::Debug for DynamicBranchingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicBranchingConfig")
            .field("execution_strategy", &self.execution_strategy)
            .field("max_concurrency", &self.max_concurrency)
            .field("batch_delay", &self.batch_delay)
            .field("aggregation", &self.aggregation)
            .field("output_key", &self.output_key)
            .finish_non_exhaustive()
    }
}
