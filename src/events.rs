//! Scheduler events and the sinks that receive them.
//!
//! Every notable state change is published as a [`SchedulerEvent`] to the
//! [`EventSink`] injected at build time. The default [`LogSink`] renders
//! events as `tracing` records; a dashboard can install its own sink and
//! keep a history instead.
//!
//! ## Example output (`LogSink`)
//! ```text
//! INFO  dispatched strategy="svm" tasks=2 validation=2 estimator=1
//! INFO  improvement strategy="svm" from=0.81 to=0.8342
//! INFO  strategy exhausted strategy="pca + nb"
//! ERROR task failed strategy="svm" task=17 message="singular matrix"
//! WARN  decreasing slots usage_pct=62 from=8 to=5
//! ```

use serde::Serialize;
use tracing::{error, info, warn};

use crate::task::TaskId;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// Tasks of one strategy were handed out in a tick.
    Dispatched {
        strategy: String,
        tasks: usize,
        validation: usize,
        estimator: usize,
    },
    /// A success beat the strategy's best average.
    Improved {
        strategy: String,
        from: f64,
        to: f64,
    },
    /// The strategy will never produce another task.
    Exhausted { strategy: String },
    /// A strategy failed to build one task.
    ProduceFailed { strategy: String, error: String },
    /// No parallelism split fits the strategy's allocation.
    InfeasibleConfig {
        strategy: String,
        budget: usize,
        error: String,
    },
    /// A dispatched task came back failed.
    TaskFailed {
        strategy: String,
        task: TaskId,
        message: String,
    },
    /// Worker CPU usage was sampled.
    WorkerUsage {
        active: usize,
        slots_running: usize,
        ratio: f64,
    },
    /// Running slots are above the limit after a shrink.
    Draining { excess: usize, max_slots: usize },
    BudgetShrunk { ratio: f64, from: usize, to: usize },
    BudgetGrown { ratio: f64, from: usize, to: usize },
    /// Operator changed the slot limit.
    SlotLimitChanged {
        from: usize,
        to: usize,
        excess: usize,
    },
    CooperationToggled { enabled: bool, max_slots: usize },
    WeightChanged {
        strategy: String,
        from: f64,
        to: f64,
    },
}

/// Receiver of scheduler events.
///
/// Called synchronously from the scheduler's control loop; keep it cheap.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

impl<F> EventSink for F
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SchedulerEvent) {
        self(event)
    }
}

/// Sink that renders events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogSink {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Dispatched {
                strategy,
                tasks,
                validation,
                estimator,
            } => {
                info!(%strategy, tasks, validation, estimator, "dispatched");
            }
            SchedulerEvent::Improved { strategy, from, to } => {
                info!(%strategy, from, to, "improvement");
            }
            SchedulerEvent::Exhausted { strategy } => {
                info!(%strategy, "strategy exhausted");
            }
            SchedulerEvent::ProduceFailed { strategy, error } => {
                error!(%strategy, %error, "failed to create a task");
            }
            SchedulerEvent::InfeasibleConfig {
                strategy,
                budget,
                error,
            } => {
                error!(%strategy, budget, %error, "could not split slot budget");
            }
            SchedulerEvent::TaskFailed {
                strategy,
                task,
                message,
            } => {
                error!(%strategy, %task, %message, "task failed");
            }
            SchedulerEvent::WorkerUsage {
                active,
                slots_running,
                ratio,
            } => {
                info!(
                    active,
                    slots_running,
                    usage_pct = (ratio * 100.0).round(),
                    "average worker CPU usage"
                );
            }
            SchedulerEvent::Draining { excess, max_slots } => {
                info!(excess, max_slots, "slots running above limit, waiting for them to finish");
            }
            SchedulerEvent::BudgetShrunk { ratio, from, to } => {
                warn!(usage_pct = (ratio * 100.0).round(), from, to, "decreasing slots");
            }
            SchedulerEvent::BudgetGrown { ratio, from, to } => {
                warn!(usage_pct = (ratio * 100.0).round(), from, to, "increasing slots");
            }
            SchedulerEvent::SlotLimitChanged { from, to, excess } => {
                info!(from, to, "changed number of slots");
                if *excess > 0 {
                    info!(excess, "slots above the current limit, waiting for normal completion");
                }
            }
            SchedulerEvent::CooperationToggled { enabled, max_slots } => {
                if *enabled {
                    info!(max_slots, "cooperation enabled, collecting usage for analysis");
                } else {
                    info!("cooperation disabled");
                }
            }
            SchedulerEvent::WeightChanged { strategy, from, to } => {
                info!(%strategy, from, to, "strategy weight changed");
            }
        }
    }
}
