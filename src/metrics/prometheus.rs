//! Prometheus metrics for the scheduler.
//!
//! Counters work standalone without a Registry; registration is only needed
//! for exposition. Metric names use a configurable `{prefix}_` (default:
//! "war").

use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};

use crate::events::SchedulerEvent;

/// Prometheus metrics for one scheduler.
///
/// Clones share the same underlying counters.
#[derive(Clone)]
pub struct SchedulerMetrics {
    // === Gauges (current values) ===
    /// Current slot limit
    pub max_slots: IntGauge,

    /// Slots held by in-flight tasks
    pub slots_running: IntGauge,

    /// Free slots under the current limit
    pub available_slots: IntGauge,

    /// Last sampled worker utilization ratio (1.0 = as expected)
    pub worker_usage_ratio: Gauge,

    // === Counters (cumulative) ===
    pub tasks_dispatched: IntCounter,
    pub tasks_finished: IntCounter,
    pub tasks_failed: IntCounter,
    pub produce_failures: IntCounter,
    pub exhausted_strategies: IntCounter,
    pub improvements: IntCounter,
    pub budget_grows: IntCounter,
    pub budget_shrinks: IntCounter,
    pub infeasible_configs: IntCounter,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(prefix: &str) -> String {
    // Valid chars: [a-zA-Z_:] for first char, [a-zA-Z0-9_:] for rest
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let ok = if i == 0 {
                c.is_ascii_alphabetic() || c == '_' || c == ':'
            } else {
                c.is_ascii_alphanumeric() || c == '_' || c == ':'
            };
            if ok {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn int_gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

fn counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

impl SchedulerMetrics {
    /// Create metrics with the default prefix "war".
    pub fn new() -> Self {
        Self::with_prefix("war")
    }

    /// Create metrics with a custom prefix.
    ///
    /// Invalid characters in the prefix are replaced with underscores, so
    /// `"my-app"` yields `my_app_tasks_dispatched`.
    pub fn with_prefix(prefix: &str) -> Self {
        let p = sanitize(prefix);
        Self {
            max_slots: int_gauge(&p, "max_slots", "Current slot limit"),
            slots_running: int_gauge(&p, "slots_running", "Slots held by in-flight tasks"),
            available_slots: int_gauge(&p, "available_slots", "Free slots under the limit"),
            worker_usage_ratio: Gauge::with_opts(Opts::new(
                format!("{p}_worker_usage_ratio"),
                "Last sampled worker utilization ratio",
            ))
            .expect("metric creation should not fail"),

            tasks_dispatched: counter(&p, "tasks_dispatched", "Tasks handed out"),
            tasks_finished: counter(&p, "tasks_finished", "Tasks collected"),
            tasks_failed: counter(&p, "tasks_failed", "Tasks collected with a failure"),
            produce_failures: counter(&p, "produce_failures", "Tasks a strategy failed to build"),
            exhausted_strategies: counter(
                &p,
                "exhausted_strategies",
                "Strategies that ran out of work",
            ),
            improvements: counter(&p, "improvements", "Best-score improvements"),
            budget_grows: counter(&p, "budget_grows", "Controller grow decisions"),
            budget_shrinks: counter(&p, "budget_shrinks", "Controller shrink decisions"),
            infeasible_configs: counter(
                &p,
                "infeasible_configs",
                "Allocations that could not be split into tasks",
            ),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.max_slots.clone()))?;
        registry.register(Box::new(self.slots_running.clone()))?;
        registry.register(Box::new(self.available_slots.clone()))?;
        registry.register(Box::new(self.worker_usage_ratio.clone()))?;
        registry.register(Box::new(self.tasks_dispatched.clone()))?;
        registry.register(Box::new(self.tasks_finished.clone()))?;
        registry.register(Box::new(self.tasks_failed.clone()))?;
        registry.register(Box::new(self.produce_failures.clone()))?;
        registry.register(Box::new(self.exhausted_strategies.clone()))?;
        registry.register(Box::new(self.improvements.clone()))?;
        registry.register(Box::new(self.budget_grows.clone()))?;
        registry.register(Box::new(self.budget_shrinks.clone()))?;
        registry.register(Box::new(self.infeasible_configs.clone()))?;
        Ok(())
    }

    /// Update the budget gauges.
    #[inline]
    pub fn set_budget(&self, max_slots: usize, slots_running: usize) {
        self.max_slots.set(max_slots as i64);
        self.slots_running.set(slots_running as i64);
        self.available_slots
            .set(max_slots.saturating_sub(slots_running) as i64);
    }

    #[inline]
    pub fn inc_tasks_finished(&self) {
        self.tasks_finished.inc();
    }

    /// Count an event.
    pub fn observe(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Dispatched { tasks, .. } => self.tasks_dispatched.inc_by(*tasks as u64),
            SchedulerEvent::Improved { .. } => self.improvements.inc(),
            SchedulerEvent::Exhausted { .. } => self.exhausted_strategies.inc(),
            SchedulerEvent::ProduceFailed { .. } => self.produce_failures.inc(),
            SchedulerEvent::InfeasibleConfig { .. } => self.infeasible_configs.inc(),
            SchedulerEvent::TaskFailed { .. } => self.tasks_failed.inc(),
            SchedulerEvent::WorkerUsage { ratio, .. } => self.worker_usage_ratio.set(*ratio),
            SchedulerEvent::BudgetShrunk { .. } => self.budget_shrinks.inc(),
            SchedulerEvent::BudgetGrown { .. } => self.budget_grows.inc(),
            SchedulerEvent::Draining { .. }
            | SchedulerEvent::SlotLimitChanged { .. }
            | SchedulerEvent::CooperationToggled { .. }
            | SchedulerEvent::WeightChanged { .. } => {}
        }
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics")
            .field("max_slots", &self.max_slots.get())
            .field("slots_running", &self.slots_running.get())
            .field("tasks_dispatched", &self.tasks_dispatched.get())
            .field("tasks_finished", &self.tasks_finished.get())
            .finish()
    }
}
