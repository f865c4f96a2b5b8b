//! Metrics for scheduler observability.
//!
//! Metrics are always collected and can optionally be exposed through a
//! Prometheus registry for scraping. The scheduler feeds every
//! [`SchedulerEvent`](crate::SchedulerEvent) it publishes into
//! [`SchedulerMetrics::observe`], so the counters mirror the event stream.
//!
//! # Available Metrics
//!
//! ## Gauges (current values)
//!
//! - `war_max_slots` - Current slot limit
//! - `war_slots_running` - Slots held by in-flight tasks
//! - `war_available_slots` - Free slots under the limit
//! - `war_worker_usage_ratio` - Last sampled worker utilization ratio
//!
//! ## Counters (cumulative)
//!
//! - `war_tasks_dispatched` - Tasks handed out
//! - `war_tasks_finished` - Tasks collected
//! - `war_tasks_failed` - Tasks collected with a failure
//! - `war_produce_failures` - Tasks a strategy failed to build
//! - `war_exhausted_strategies` - Strategies that ran out of work
//! - `war_improvements` - Best-score improvements
//! - `war_budget_grows` - Controller grow decisions
//! - `war_budget_shrinks` - Controller shrink decisions
//! - `war_infeasible_configs` - Ticks where a strategy's share could not be split
//!
//! # Example
//!
//! ```ignore
//! use prometheus::Registry;
//! use war_scheduler::SchedulerBuilder;
//!
//! let registry = Registry::new();
//! let scheduler = SchedulerBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build(strategies)?;
//!
//! let encoder = prometheus::TextEncoder::new();
//! let mut buffer = Vec::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

mod prometheus;

pub use prometheus::SchedulerMetrics;
