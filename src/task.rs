//! Dispatched tasks, their results and score records.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyId;

/// Scheduler-unique identifier of a dispatched task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work with its resolved parallelism and slot cost.
///
/// Fields are private: a task is immutable once the scheduler hands it out.
/// It is not `Clone`, so each dispatched task can be collected only once.
#[derive(Debug)]
pub struct Task<P> {
    id: TaskId,
    strategy: StrategyId,
    estimator_parallelism: usize,
    n_jobs: usize,
    total_jobs: usize,
    payload: P,
}

impl<P> Task<P> {
    pub(crate) fn new(
        id: TaskId,
        strategy: StrategyId,
        estimator_parallelism: usize,
        n_jobs: usize,
        payload: P,
    ) -> Self {
        Self {
            id,
            strategy,
            estimator_parallelism,
            n_jobs,
            total_jobs: n_jobs * estimator_parallelism,
            payload,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Strategy that produced the task.
    pub fn strategy(&self) -> StrategyId {
        self.strategy
    }

    /// Threads the estimator itself may use.
    pub fn estimator_parallelism(&self) -> usize {
        self.estimator_parallelism
    }

    /// Parallelism of the validation loop around the estimator.
    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    /// Slots charged against the budget while the task runs.
    pub fn total_jobs(&self) -> usize {
        self.total_jobs
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Aggregate of the per-fold scores of one evaluation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub avg: f64,
    #[serde(default)]
    pub std: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

impl Aggregate {
    /// Aggregate a slice of per-fold scores. Empty input yields zeros.
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let n = scores.len() as f64;
        let avg = scores.iter().sum::<f64>() / n;
        let var = scores.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n;
        Self {
            avg,
            std: var.sqrt(),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Best-so-far record: aggregate plus the per-fold scores behind it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub agg: Aggregate,
    #[serde(default)]
    pub scores: Vec<f64>,
}

impl ScoreRecord {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            agg: Aggregate::from_scores(&scores),
            scores,
        }
    }

    /// A record carrying only an average, as seeded from a cache.
    pub fn with_avg(avg: f64) -> Self {
        Self {
            agg: Aggregate {
                avg,
                std: 0.0,
                min: avg,
                max: avg,
            },
            scores: Vec::new(),
        }
    }
}

/// Error detail of a failed task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default)]
    pub trace: String,
    /// Free-form context (parameters, fold, etc.) supplied by the substrate.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
            context: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
}

/// What the execution substrate observed.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success(ScoreRecord),
    Failed(ErrorInfo),
}

/// Completion of a dispatched task, consumed once by `collect`.
#[derive(Debug)]
pub struct TaskResult<P> {
    pub task: Task<P>,
    /// Slots to release; normally `task.total_jobs()`.
    pub jobs: usize,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl<P> TaskResult<P> {
    /// Successful completion releasing the task's full slot cost.
    pub fn success(task: Task<P>, elapsed: Duration, scores: Vec<f64>) -> Self {
        Self {
            jobs: task.total_jobs(),
            task,
            elapsed,
            outcome: Outcome::Success(ScoreRecord::new(scores)),
        }
    }

    /// Failed completion releasing the task's full slot cost.
    pub fn failure(task: Task<P>, elapsed: Duration, error: ErrorInfo) -> Self {
        Self {
            jobs: task.total_jobs(),
            task,
            elapsed,
            outcome: Outcome::Failed(error),
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self.outcome {
            Outcome::Success(_) => TaskStatus::Success,
            Outcome::Failed(_) => TaskStatus::Failed,
        }
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match &self.outcome {
            Outcome::Failed(info) => Some(info),
            Outcome::Success(_) => None,
        }
    }
}
