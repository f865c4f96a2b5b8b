//! # war-scheduler
//!
//! **Strategies at war over CPU slots**
//!
//! A bandit-driven scheduler that shares a fixed pool of CPU slots among
//! competing work-producing strategies, decides how much parallelism each
//! dispatched task may use, and adapts the slot budget to observed worker
//! CPU usage.
//!
//! ## Features
//!
//! - **Bandit Allocation**: free slots follow each strategy's best score,
//!   with a warm-up bonus forcing early exploration
//! - **Exact Parallelism Split**: every strategy's share becomes
//!   `tasks × validation × estimator` with the largest product that fits
//! - **Feedback Control**: optional rate-limited, hysteresis-banded
//!   grow/shrink of the budget from per-worker CPU samples
//! - **Never Preempts**: shrinking only stops new dispatch; running tasks drain
//! - **Flexible Configuration**: files (TOML/YAML/JSON), environment
//!   variables, code, or clap CLI arguments
//! - **Observability**: structured `tracing` events through a pluggable
//!   [`EventSink`] and optional Prometheus metrics
//!
//! ## Quick Start
//!
//! ```
//! use std::time::Duration;
//! use war_scheduler::{
//!     FnStrategy, ProduceError, Registration, SchedulerBuilder, StrategyParams, TaskResult,
//! };
//!
//! fn grid(name: &str) -> Registration<String> {
//!     let name = name.to_string();
//!     let mut n = 0;
//!     Registration::new(FnStrategy::new(
//!         StrategyParams::new(name.clone()).with_warm_up(1),
//!         move |threads: usize| -> Result<String, ProduceError> {
//!             n += 1;
//!             Ok(format!("{name} #{n} on {threads} threads"))
//!         },
//!     ))
//! }
//!
//! let mut scheduler = SchedulerBuilder::new()
//!     .consumers(4)
//!     .seed(1)
//!     .build(vec![grid("nb"), grid("svm")])?;
//!
//! let batch = scheduler.next()?;
//! assert!(!batch.is_empty());
//! for task in batch {
//!     // Run the task on a worker pool, then report back.
//!     scheduler.collect(TaskResult::success(task, Duration::from_millis(5), vec![0.8]))?;
//! }
//! assert_eq!(scheduler.slots_running(), 0);
//! # Ok::<(), war_scheduler::SchedError>(())
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides and CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! cpuset = "0-7"
//! max_slots = 6
//! max_threads_per_evaluation = 0
//! cooperate = true
//! allocation = "systematic"
//! on_infeasible = "skip"
//!
//! [controller]
//! interval_secs = 60
//! shrink_below = 0.95
//! grow_above = 1.10
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("WAR")`:
//! - `WAR_CONSUMERS=8`
//! - `WAR_MAX_SLOTS=6`
//! - `WAR_CONTROLLER__INTERVAL_SECS=30`
//!
//! ## Offset Bounds
//!
//! `max_parallel_tasks`, `max_threads_per_estimator` and
//! `max_threads_per_evaluation` accept non-positive values meaning
//! "consumers minus N": with 8 consumers, `0` is 8 and `-2` is 6.

pub mod bandit;
pub mod builder;
pub mod config;
pub mod controller;
pub mod cpuset;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod strategy;
pub mod task;

pub use bandit::{AllocationMode, BanditKnobs};
pub use builder::{SchedulerArgs, SchedulerBuilder};
pub use config::{InfeasiblePolicy, SchedulerConfig};
pub use controller::{
    Adjustment, Clock, ControllerKnobs, CpuSampler, ManualClock, NoSampler, SystemClock,
    WorkerUsage,
};
pub use error::{Result, SchedError};
pub use events::{EventSink, LogSink, SchedulerEvent};
pub use ledger::{Ledger, LedgerEntry, StrategyCache};
pub use metrics::SchedulerMetrics;
pub use optimizer::TaskConfig;
pub use scheduler::{
    Registration, ReportSummary, Scheduler, SchedulerSnapshot, StrategyReport, StrategyRow,
    StrategyScore,
};
pub use strategy::{FnStrategy, ProduceError, Strategy, StrategyId, StrategyParams};
pub use task::{
    Aggregate, ErrorInfo, Outcome, ScoreRecord, Task, TaskId, TaskResult, TaskStatus,
};
