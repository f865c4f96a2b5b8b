//! Error types for war-scheduler.

use thiserror::Error;

use crate::strategy::StrategyId;

/// Errors raised by the scheduler and its configuration layer.
#[derive(Debug, Error)]
pub enum SchedError {
    /// No integer split of the slot budget satisfies the parallelism bounds.
    #[error(
        "infeasible task configuration: budget={budget} max_tasks={max_tasks} \
         max_validation={max_validation} max_estimator={max_estimator}"
    )]
    InfeasibleConfig {
        budget: usize,
        max_tasks: i64,
        max_validation: i64,
        max_estimator: i64,
    },

    /// A result referenced a strategy the scheduler does not know.
    #[error("no such strategy: {0}")]
    NoSuchStrategy(StrategyId),

    /// Releasing slots would drive the running count negative.
    #[error("slot underflow: releasing {released} slots with only {running} running")]
    SlotUnderflow { running: usize, released: usize },

    /// A completion releases more than its strategy holds.
    #[error(
        "strategy {strategy} holds {slots} slots in {running} tasks, cannot release {released}"
    )]
    StrategyUnderflow {
        strategy: StrategyId,
        running: usize,
        slots: usize,
        released: usize,
    },

    /// Requested slot limit is above the consumer count.
    #[error("maximum number of slots must be up to {consumers}, got {requested}")]
    SlotLimitExceeded { requested: usize, consumers: usize },

    /// Requested slot limit is below the budget floor.
    #[error("maximum number of slots must be at least {floor}, got {requested}")]
    SlotLimitTooLow { requested: usize, floor: usize },

    /// 1-based strategy index outside the registered range.
    #[error("no strategy was found at index {index} (have {count})")]
    StrategyIndexOutOfRange { index: usize, count: usize },

    /// Two registered strategies share a name, and therefore an id.
    #[error("duplicate strategy name '{0}'")]
    DuplicateStrategy(String),

    /// The scheduler was built without any strategy.
    #[error("at least one strategy must be registered")]
    NoStrategies,

    /// Consumer count or initial slot limit is unusable.
    #[error("invalid consumer configuration: {0}")]
    InvalidConsumers(String),

    /// Error parsing CPU set string.
    #[error("invalid cpuset format: {0}")]
    InvalidCpuSet(String),

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error registering metrics with a prometheus registry.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedError>;
