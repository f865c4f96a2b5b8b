//! Work-producing strategies as seen by the scheduler.
//!
//! A strategy is anything that can build an opaque unit of work on demand.
//! The scheduler only reads its [`StrategyParams`], occasionally rewrites
//! its weight, and calls [`Strategy::produce`] with the estimator
//! parallelism it resolved for the current tick.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifier of a strategy, derived from its name.
///
/// Results carry this id back to [`Scheduler::collect`](crate::Scheduler::collect)
/// so the completion can be charged to the right ledger entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(pub u64);

impl StrategyId {
    /// Create a strategy id from a name.
    ///
    /// ```
    /// use war_scheduler::StrategyId;
    ///
    /// assert_eq!(StrategyId::from_name("nb"), StrategyId::from_name("nb"));
    /// assert_ne!(StrategyId::from_name("nb"), StrategyId::from_name("pca-nb"));
    /// ```
    pub fn from_name(name: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        StrategyId(hasher.finish())
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Scheduling parameters of a strategy.
///
/// `max_parallel_tasks` and `max_threads_per_estimator` follow the offset
/// convention: a positive value is an absolute bound, a non-positive value
/// `N` means `consumers + N`. See [`resolve_bound`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Display name, also the source of the strategy id.
    pub name: String,

    /// Multiplier applied to the best score before normalisation.
    /// Default: 1.0
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Cap on finished tasks, `None` for unbounded.
    #[serde(default)]
    pub max_tasks: Option<u64>,

    /// Bound on tasks dispatched together in one tick.
    /// Default: 1
    #[serde(default = "default_bound")]
    pub max_parallel_tasks: i64,

    /// Bound on the estimator-internal parallelism of one task.
    /// Default: 1
    #[serde(default = "default_bound")]
    pub max_threads_per_estimator: i64,

    /// Finished tasks required before the score dominates exploration.
    /// Default: 5
    #[serde(default = "default_warm_up")]
    pub warm_up: u64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_bound() -> i64 {
    1
}

fn default_warm_up() -> u64 {
    5
}

impl StrategyParams {
    /// Parameters with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            max_tasks: None,
            max_parallel_tasks: default_bound(),
            max_threads_per_estimator: default_bound(),
            warm_up: default_warm_up(),
        }
    }

    /// The id derived from the name.
    pub fn id(&self) -> StrategyId {
        StrategyId::from_name(&self.name)
    }

    /// Builder method to set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Builder method to cap the number of finished tasks.
    pub fn with_max_tasks(mut self, max_tasks: u64) -> Self {
        self.max_tasks = Some(max_tasks);
        self
    }

    /// Builder method to set both parallelism bounds.
    pub fn with_parallelism(mut self, max_parallel_tasks: i64, max_threads_per_estimator: i64) -> Self {
        self.max_parallel_tasks = max_parallel_tasks;
        self.max_threads_per_estimator = max_threads_per_estimator;
        self
    }

    /// Builder method to set the warm-up count.
    pub fn with_warm_up(mut self, warm_up: u64) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Whether `finished` tasks already reached the cap.
    pub fn is_capped(&self, finished: u64) -> bool {
        self.max_tasks.is_some_and(|max| finished >= max)
    }
}

/// Resolve a parallelism bound against the consumer count.
///
/// ```
/// use war_scheduler::strategy::resolve_bound;
///
/// assert_eq!(resolve_bound(3, 8), 3);
/// assert_eq!(resolve_bound(0, 8), 8);
/// assert_eq!(resolve_bound(-2, 8), 6);
/// ```
pub fn resolve_bound(value: i64, consumers: usize) -> i64 {
    if value > 0 {
        value
    } else {
        consumers as i64 + value
    }
}

/// Why a strategy did not produce a task.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The strategy will never produce another task.
    #[error("strategy is exhausted")]
    Exhausted,

    /// Building this particular task failed.
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ProduceError {
    /// Wrap any error as a construction failure.
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ProduceError::Failed(err.into())
    }
}

/// A work-producing policy competing for CPU slots.
///
/// `P` is the opaque payload the execution substrate runs; the scheduler
/// wraps it into a [`Task`](crate::Task) carrying the resolved parallelism.
pub trait Strategy<P>: Send {
    /// Scheduling parameters.
    fn params(&self) -> &StrategyParams;

    /// Mutable access, used by operator controls such as weight changes.
    fn params_mut(&mut self) -> &mut StrategyParams;

    /// Build the next unit of work using `estimator_parallelism` threads.
    ///
    /// Return [`ProduceError::Exhausted`] once no more work will ever be
    /// available; any other error only skips the current task slot.
    fn produce(&mut self, estimator_parallelism: usize) -> Result<P, ProduceError>;
}

impl<P, S: Strategy<P> + ?Sized> Strategy<P> for Box<S> {
    fn params(&self) -> &StrategyParams {
        (**self).params()
    }

    fn params_mut(&mut self) -> &mut StrategyParams {
        (**self).params_mut()
    }

    fn produce(&mut self, estimator_parallelism: usize) -> Result<P, ProduceError> {
        (**self).produce(estimator_parallelism)
    }
}

/// Closure-backed strategy.
///
/// Handy for drivers whose strategies are plain generators:
///
/// ```
/// use war_scheduler::{FnStrategy, ProduceError, Strategy, StrategyParams};
///
/// let mut left = 2;
/// let mut s = FnStrategy::new(StrategyParams::new("countdown"), move |threads: usize| {
///     if left == 0 {
///         return Err(ProduceError::Exhausted);
///     }
///     left -= 1;
///     Ok(threads)
/// });
/// assert_eq!(s.produce(1).unwrap(), 1);
/// ```
pub struct FnStrategy<F> {
    params: StrategyParams,
    f: F,
}

impl<F> FnStrategy<F> {
    /// Wrap a closure with the given parameters.
    pub fn new(params: StrategyParams, f: F) -> Self {
        Self { params, f }
    }
}

impl<P, F> Strategy<P> for FnStrategy<F>
where
    F: FnMut(usize) -> Result<P, ProduceError> + Send,
{
    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut StrategyParams {
        &mut self.params
    }

    fn produce(&mut self, estimator_parallelism: usize) -> Result<P, ProduceError> {
        (self.f)(estimator_parallelism)
    }
}
