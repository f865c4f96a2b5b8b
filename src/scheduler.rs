//! The scheduler: one synchronous control loop over the slot budget.
//!
//! A driver calls [`Scheduler::next`] to get a batch of tasks, runs them on
//! its worker pool, and hands every completion back to
//! [`Scheduler::collect`]. Neither call blocks. All state lives in the
//! scheduler value itself; callers that share it across threads wrap it in
//! a mutex.
//!
//! # Tick
//!
//! ```text
//! next()
//!   ├─ cooperate()            (when cooperation mode is on, rate limited)
//!   ├─ available = max_slots - slots_running
//!   ├─ probabilities()        bandit weights over eligible strategies
//!   ├─ allocate(available)    slots per strategy
//!   ├─ per strategy: solve(slots, bounds) → tasks × validation × estimator
//!   └─ per planned strategy: produce() × tasks → charge ledger, append to batch
//! ```
//!
//! Every split is solved before the first task is produced, so a tick that
//! aborts on an infeasible split has charged nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::bandit::{self, AllocationMode, Arm, BanditKnobs};
use crate::config::{check_slot_limit, InfeasiblePolicy, SchedulerConfig};
use crate::controller::{Adjustment, Budget, Clock, CpuSampler, FeedbackController, WorkerUsage};
use crate::error::{Result, SchedError};
use crate::events::{EventSink, SchedulerEvent};
use crate::ledger::{Ledger, LedgerEntry, StrategyCache};
use crate::metrics::SchedulerMetrics;
use crate::optimizer::{self, TaskConfig};
use crate::strategy::{resolve_bound, ProduceError, Strategy, StrategyId, StrategyParams};
use crate::task::{Outcome, Task, TaskId, TaskResult};

/// A strategy together with the history it starts from.
pub struct Registration<P> {
    pub strategy: Box<dyn Strategy<P>>,
    pub cache: StrategyCache,
}

impl<P> Registration<P> {
    /// Register a strategy with an empty history.
    pub fn new(strategy: impl Strategy<P> + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
            cache: StrategyCache::default(),
        }
    }

    /// Seed the ledger entry from a cached history.
    pub fn with_cache(mut self, cache: StrategyCache) -> Self {
        self.cache = cache;
        self
    }
}

/// Best result of one strategy, for inspection.
#[derive(Clone, Debug, Serialize)]
pub struct StrategyReport {
    /// 1-based position in registration order.
    pub index: usize,
    pub params: StrategyParams,
    pub entry: LedgerEntry,
    pub mean_time_secs: Option<f64>,
}

/// One line of a periodic report.
#[derive(Clone, Debug, Serialize)]
pub struct StrategyScore {
    pub name: String,
    pub best_avg: f64,
    pub finished: u64,
}

/// Periodic summary returned by [`Scheduler::take_report`], best first.
#[derive(Clone, Debug, Serialize)]
pub struct ReportSummary {
    pub tasks_finished: u64,
    pub max_slots: usize,
    pub slots_running: usize,
    pub strategies: Vec<StrategyScore>,
}

/// Per-strategy row of a [`SchedulerSnapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct StrategyRow {
    pub index: usize,
    pub name: String,
    pub weight: f64,
    /// Current sampling probability (0 when ineligible).
    pub probability: f64,
    pub best_avg: f64,
    pub best_std: f64,
    pub finished: u64,
    pub running: usize,
    pub slots: usize,
    pub exhausted: bool,
    pub mean_time_secs: Option<f64>,
}

/// Read-only view of the scheduler for a presentation layer.
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerSnapshot {
    pub consumers: usize,
    pub validation_bound: i64,
    pub max_slots: usize,
    pub slots_running: usize,
    pub tasks_finished: u64,
    pub cooperation_mode: bool,
    pub secs_since_cooperation: Option<f64>,
    pub strategies: Vec<StrategyRow>,
}

/// Slot scheduler over strategies producing payloads of type `P`.
///
/// Build one with [`SchedulerBuilder`](crate::SchedulerBuilder), or
/// [`Scheduler::new`] for a config already in hand.
pub struct Scheduler<P> {
    strategies: Vec<Box<dyn Strategy<P>>>,
    ledger: Ledger,

    consumers: usize,
    validation_bound: i64,
    slot_floor: usize,
    max_slots: usize,
    slots_running: usize,
    cooperation_mode: bool,
    tasks_finished: u64,
    next_task_id: u64,
    last_error: Option<TaskResult<P>>,

    improved: bool,
    last_reported: u64,
    report_every: u64,

    allocation: AllocationMode,
    on_infeasible: InfeasiblePolicy,
    bandit: BanditKnobs,
    controller: FeedbackController,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    metrics: SchedulerMetrics,
    rng: SmallRng,
}

impl<P> Scheduler<P> {
    /// Create a scheduler with the default collaborators: no CPU sampler,
    /// the wall clock, and a [`LogSink`](crate::LogSink).
    ///
    /// # Errors
    ///
    /// See [`Scheduler::from_config`].
    pub fn new(config: SchedulerConfig, registrations: Vec<Registration<P>>) -> Result<Self> {
        Self::from_config(
            config,
            registrations,
            Box::new(crate::controller::NoSampler),
            Arc::new(crate::controller::SystemClock),
            Arc::new(crate::events::LogSink),
        )
    }

    /// Create a scheduler from a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no strategy is registered, or two share a name
    /// - the consumer count or initial slot limit is invalid
    /// - metrics fail to register with the configured registry
    pub fn from_config(
        config: SchedulerConfig,
        registrations: Vec<Registration<P>>,
        sampler: Box<dyn CpuSampler>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        if registrations.is_empty() {
            return Err(SchedError::NoStrategies);
        }
        let consumers = config.resolve_consumers()?;
        let max_slots = config.effective_max_slots(consumers)?;

        let mut ledger = Ledger::new();
        let mut strategies = Vec::with_capacity(registrations.len());
        for Registration { strategy, cache } in registrations {
            let params = strategy.params();
            ledger.insert(LedgerEntry::from_cache(params.id(), params.name.clone(), cache))?;
            strategies.push(strategy);
        }

        let metrics = SchedulerMetrics::with_prefix(&config.metrics_prefix);
        if let Some(ref registry) = config.prometheus_registry {
            metrics.register(registry)?;
        }
        metrics.set_budget(max_slots, 0);

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        info!(
            consumers,
            max_slots,
            strategies = strategies.len(),
            cooperate = config.cooperate,
            "scheduler ready"
        );

        Ok(Self {
            strategies,
            ledger,
            consumers,
            validation_bound: config.validation_bound(consumers),
            slot_floor: config.slot_floor(consumers),
            max_slots,
            slots_running: 0,
            cooperation_mode: config.cooperate,
            tasks_finished: 0,
            next_task_id: 0,
            last_error: None,
            improved: false,
            last_reported: 0,
            report_every: config.report_every,
            allocation: config.allocation,
            on_infeasible: config.on_infeasible,
            bandit: config.bandit,
            controller: FeedbackController::new(config.controller, sampler),
            clock,
            sink,
            metrics,
            rng,
        })
    }

    /// Run one scheduling tick and return the tasks to dispatch.
    ///
    /// An empty batch is normal: the budget may be full or every strategy
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Only with [`InfeasiblePolicy::Abort`], when a strategy's slot share
    /// cannot be split. No task is produced or charged in that tick.
    pub fn next(&mut self) -> Result<Vec<Task<P>>> {
        let now = self.clock.now();
        self.controller.touch(now);
        if self.cooperation_mode {
            self.cooperate_at(now, false);
        }

        let available = self.available_slots();
        if available == 0 {
            return Ok(Vec::new());
        }
        let Some(probs) = self.probabilities() else {
            debug!("no eligible strategy");
            return Ok(Vec::new());
        };
        let counts = bandit::allocate(&probs, available, self.allocation, &mut self.rng);

        let mut plan = Vec::new();
        for (pos, slots) in counts.into_iter().enumerate() {
            if slots == 0 {
                continue;
            }
            if let Some(cfg) = self.split(pos, slots)? {
                plan.push((pos, cfg));
            }
        }

        let mut batch = Vec::new();
        for (pos, cfg) in plan {
            self.dispatch(pos, cfg, &mut batch);
        }
        self.metrics.set_budget(self.max_slots, self.slots_running);
        Ok(batch)
    }

    /// Solve the split of `slots` for the strategy at `pos`.
    ///
    /// `Ok(None)` when the split is infeasible and the policy is to skip.
    fn split(&self, pos: usize, slots: usize) -> Result<Option<TaskConfig>> {
        let params = self.strategies[pos].params();
        let max_tasks = resolve_bound(params.max_parallel_tasks, self.consumers);
        let max_estimator = resolve_bound(params.max_threads_per_estimator, self.consumers);

        match optimizer::solve(slots, max_tasks, self.validation_bound, max_estimator) {
            Ok(cfg) => {
                debug!(strategy = %params.name, slots, ?cfg, "split slot share");
                Ok(Some(cfg))
            }
            Err(e) => {
                self.emit(SchedulerEvent::InfeasibleConfig {
                    strategy: params.name.clone(),
                    budget: slots,
                    error: e.to_string(),
                });
                match self.on_infeasible {
                    InfeasiblePolicy::Skip => Ok(None),
                    InfeasiblePolicy::Abort => Err(e),
                }
            }
        }
    }

    fn dispatch(&mut self, pos: usize, cfg: TaskConfig, batch: &mut Vec<Task<P>>) {
        let name = self.strategies[pos].params().name.clone();
        let id = self.ledger.entries()[pos].id;
        let cost = cfg.per_task_cost();
        let mut produced = 0;
        for _ in 0..cfg.tasks {
            match self.strategies[pos].produce(cfg.estimator_parallelism) {
                Ok(payload) => {
                    let task_id = TaskId(self.next_task_id);
                    self.next_task_id += 1;
                    batch.push(Task::new(
                        task_id,
                        id,
                        cfg.estimator_parallelism,
                        cfg.validation_parallelism,
                        payload,
                    ));
                    self.ledger.charge(pos, cost);
                    self.slots_running += cost;
                    produced += 1;
                }
                Err(ProduceError::Exhausted) => {
                    if self.ledger.mark_exhausted(pos) {
                        self.emit(SchedulerEvent::Exhausted {
                            strategy: name.clone(),
                        });
                    }
                    break;
                }
                Err(ProduceError::Failed(err)) => {
                    self.emit(SchedulerEvent::ProduceFailed {
                        strategy: name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if produced > 0 {
            self.emit(SchedulerEvent::Dispatched {
                strategy: name,
                tasks: produced,
                validation: cfg.validation_parallelism,
                estimator: cfg.estimator_parallelism,
            });
        }
    }

    /// Absorb one completion.
    ///
    /// # Errors
    ///
    /// [`SchedError::SlotUnderflow`] if the result releases more slots than
    /// are running, [`SchedError::StrategyUnderflow`] if it releases more
    /// than its strategy holds, [`SchedError::NoSuchStrategy`] if it names
    /// an unknown strategy. All leave the scheduler untouched and indicate a
    /// driver bug.
    pub fn collect(&mut self, result: TaskResult<P>) -> Result<()> {
        let jobs = result.jobs;
        if jobs > self.slots_running {
            return Err(SchedError::SlotUnderflow {
                running: self.slots_running,
                released: jobs,
            });
        }
        let pos = self
            .ledger
            .release(result.task.strategy(), jobs, result.elapsed)?;
        self.slots_running -= jobs;
        self.tasks_finished += 1;
        self.metrics.inc_tasks_finished();
        self.metrics.set_budget(self.max_slots, self.slots_running);

        let name = self.ledger.entries()[pos].name.clone();
        if let Some(message) = result.error_info().map(|info| info.message.clone()) {
            self.emit(SchedulerEvent::TaskFailed {
                strategy: name,
                task: result.task.id(),
                message,
            });
            self.last_error = Some(result);
            return Ok(());
        }
        if let Outcome::Success(record) = &result.outcome {
            if let Some(from) = self.ledger.offer_best(pos, record) {
                self.improved = true;
                self.emit(SchedulerEvent::Improved {
                    strategy: name,
                    from,
                    to: record.agg.avg,
                });
            }
        }
        Ok(())
    }

    /// Run the feedback controller now.
    ///
    /// Without `force` this is a no-op inside the controller interval.
    pub fn cooperate(&mut self, force: bool) -> Adjustment {
        let now = self.clock.now();
        self.cooperate_at(now, force)
    }

    fn cooperate_at(&mut self, now: Instant, force: bool) -> Adjustment {
        let budget = Budget {
            max_slots: self.max_slots,
            slots_running: self.slots_running,
            consumers: self.consumers,
        };
        let (adjustment, usage) = self.controller.evaluate(now, force, budget);
        if let Some(usage) = usage.filter(|u| u.active > 0) {
            self.emit(SchedulerEvent::WorkerUsage {
                active: usage.active,
                slots_running: self.slots_running,
                ratio: usage.ratio,
            });
        }

        match adjustment {
            Adjustment::Shrink { ratio, from, to } => {
                self.max_slots = to;
                self.emit(SchedulerEvent::BudgetShrunk { ratio, from, to });
            }
            Adjustment::Grow { ratio, from, to } => {
                self.max_slots = to;
                self.emit(SchedulerEvent::BudgetGrown { ratio, from, to });
            }
            Adjustment::Draining { excess } => {
                self.emit(SchedulerEvent::Draining {
                    excess,
                    max_slots: self.max_slots,
                });
            }
            Adjustment::RateLimited | Adjustment::NoSignal | Adjustment::Hold { .. } => {}
        }
        self.metrics.set_budget(self.max_slots, self.slots_running);
        adjustment
    }

    /// Flip cooperation mode and return the new state.
    ///
    /// Enabling restarts the controller interval and CPU accounting.
    pub fn toggle_cooperate(&mut self) -> bool {
        self.cooperation_mode = !self.cooperation_mode;
        if self.cooperation_mode {
            self.controller.reset(self.clock.now());
        }
        self.emit(SchedulerEvent::CooperationToggled {
            enabled: self.cooperation_mode,
            max_slots: self.max_slots,
        });
        self.cooperation_mode
    }

    /// Change the slot limit.
    ///
    /// Lowering it below the running slots is allowed; the excess drains
    /// as tasks complete.
    ///
    /// # Errors
    ///
    /// [`SchedError::SlotLimitExceeded`] if `max_slots` is above the
    /// consumer count, [`SchedError::SlotLimitTooLow`] if it is below the
    /// controller's `min_slots` floor.
    pub fn set_max_slots(&mut self, max_slots: usize) -> Result<()> {
        check_slot_limit(max_slots, self.slot_floor, self.consumers)?;
        if max_slots == self.max_slots {
            return Ok(());
        }
        let from = self.max_slots;
        self.max_slots = max_slots;
        self.emit(SchedulerEvent::SlotLimitChanged {
            from,
            to: max_slots,
            excess: self.slots_running.saturating_sub(max_slots),
        });
        self.metrics.set_budget(self.max_slots, self.slots_running);
        Ok(())
    }

    /// Set the weight of a strategy by id.
    ///
    /// # Errors
    ///
    /// [`SchedError::NoSuchStrategy`] for an unknown id.
    pub fn set_weight(&mut self, id: StrategyId, weight: f64) -> Result<()> {
        let pos = self
            .ledger
            .position(id)
            .ok_or(SchedError::NoSuchStrategy(id))?;
        self.set_weight_pos(pos, weight);
        Ok(())
    }

    /// Set the weight of the strategy at a 1-based index.
    ///
    /// # Errors
    ///
    /// [`SchedError::StrategyIndexOutOfRange`] for a bad index.
    pub fn set_weight_at(&mut self, index: usize, weight: f64) -> Result<()> {
        let pos = self.position_at(index)?;
        self.set_weight_pos(pos, weight);
        Ok(())
    }

    fn set_weight_pos(&mut self, pos: usize, weight: f64) {
        let params = self.strategies[pos].params_mut();
        let from = params.weight;
        params.weight = weight;
        let strategy = params.name.clone();
        self.emit(SchedulerEvent::WeightChanged {
            strategy,
            from,
            to: weight,
        });
    }

    fn position_at(&self, index: usize) -> Result<usize> {
        let count = self.strategies.len();
        if index == 0 || index > count {
            return Err(SchedError::StrategyIndexOutOfRange { index, count });
        }
        Ok(index - 1)
    }

    /// Parameters of the strategy at a 1-based index.
    ///
    /// # Errors
    ///
    /// [`SchedError::StrategyIndexOutOfRange`] for a bad index.
    pub fn strategy_by_index(&self, index: usize) -> Result<&StrategyParams> {
        let pos = self.position_at(index)?;
        Ok(self.strategies[pos].params())
    }

    /// Best result of the strategy at a 1-based index.
    ///
    /// # Errors
    ///
    /// [`SchedError::StrategyIndexOutOfRange`] for a bad index.
    pub fn report_best(&self, index: usize) -> Result<StrategyReport> {
        let pos = self.position_at(index)?;
        let entry = self.ledger.entries()[pos].clone();
        Ok(StrategyReport {
            index,
            params: self.strategies[pos].params().clone(),
            mean_time_secs: entry.mean_time().map(|d| d.as_secs_f64()),
            entry,
        })
    }

    /// Sample worker usage without adjusting the budget.
    pub fn report_worker_usage(&mut self) -> WorkerUsage {
        let usage = self.controller.usage(self.slots_running, self.consumers);
        self.emit(SchedulerEvent::WorkerUsage {
            active: usage.active,
            slots_running: self.slots_running,
            ratio: usage.ratio,
        });
        usage
    }

    /// Periodic report, when one is due.
    ///
    /// Due once `report_every` tasks finished since the last report and some
    /// strategy improved in the meantime. Taking a report resets both.
    pub fn take_report(&mut self) -> Option<ReportSummary> {
        let due = self.tasks_finished >= self.last_reported + self.report_every;
        if !(due && self.improved) {
            return None;
        }
        self.improved = false;
        self.last_reported = self.tasks_finished;

        let mut strategies: Vec<StrategyScore> = self
            .ledger
            .entries()
            .iter()
            .map(|e| StrategyScore {
                name: e.name.clone(),
                best_avg: e.best.agg.avg,
                finished: e.finished,
            })
            .collect();
        strategies.sort_by(|a, b| b.best_avg.total_cmp(&a.best_avg));
        Some(ReportSummary {
            tasks_finished: self.tasks_finished,
            max_slots: self.max_slots,
            slots_running: self.slots_running,
            strategies,
        })
    }

    /// Current history of every strategy, keyed by name, in the shape
    /// accepted by [`Registration::with_cache`].
    pub fn export_cache(&self) -> BTreeMap<String, StrategyCache> {
        self.ledger
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.to_cache()))
            .collect()
    }

    /// Serializable view of the whole scheduler.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let probs = self.probabilities();
        let strategies = self
            .strategies
            .iter()
            .zip(self.ledger.entries())
            .enumerate()
            .map(|(pos, (strategy, entry))| StrategyRow {
                index: pos + 1,
                name: entry.name.clone(),
                weight: strategy.params().weight,
                probability: probs.as_ref().map_or(0.0, |p| p[pos]),
                best_avg: entry.best.agg.avg,
                best_std: entry.best.agg.std,
                finished: entry.finished,
                running: entry.running,
                slots: entry.slots,
                exhausted: entry.exhausted,
                mean_time_secs: entry.mean_time().map(|d| d.as_secs_f64()),
            })
            .collect();
        SchedulerSnapshot {
            consumers: self.consumers,
            validation_bound: self.validation_bound,
            max_slots: self.max_slots,
            slots_running: self.slots_running,
            tasks_finished: self.tasks_finished,
            cooperation_mode: self.cooperation_mode,
            secs_since_cooperation: self
                .controller
                .last_coop_time()
                .map(|t| self.clock.now().saturating_duration_since(t).as_secs_f64()),
            strategies,
        }
    }

    /// Sampling distribution over strategies in registration order.
    ///
    /// `None` when no strategy is eligible.
    pub fn probabilities(&self) -> Option<Vec<f64>> {
        let arms: Vec<Arm<'_>> = self
            .strategies
            .iter()
            .zip(self.ledger.entries())
            .map(|(strategy, entry)| (strategy.params(), entry))
            .collect();
        bandit::probabilities(&arms, &self.bandit)
    }

    fn emit(&self, event: SchedulerEvent) {
        self.metrics.observe(&event);
        self.sink.on_event(&event);
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Validation-parallelism bound after offset resolution.
    pub fn validation_bound(&self) -> i64 {
        self.validation_bound
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn slots_running(&self) -> usize {
        self.slots_running
    }

    pub fn available_slots(&self) -> usize {
        self.max_slots.saturating_sub(self.slots_running)
    }

    pub fn tasks_finished(&self) -> u64 {
        self.tasks_finished
    }

    pub fn cooperation_mode(&self) -> bool {
        self.cooperation_mode
    }

    pub fn last_coop_time(&self) -> Option<Instant> {
        self.controller.last_coop_time()
    }

    /// Most recent failed result.
    pub fn last_error(&self) -> Option<&TaskResult<P>> {
        self.last_error.as_ref()
    }

    pub fn improved_since_last_report(&self) -> bool {
        self.improved
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }
}

impl<P> std::fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("strategies", &self.strategies.len())
            .field("consumers", &self.consumers)
            .field("max_slots", &self.max_slots)
            .field("slots_running", &self.slots_running)
            .field("tasks_finished", &self.tasks_finished)
            .field("cooperation_mode", &self.cooperation_mode)
            .finish_non_exhaustive()
    }
}
