//! Feedback controller: grows or shrinks the usable slot budget from
//! observed worker CPU utilization.
//!
//! The controller is polled, never pushed. It evaluates at most once per
//! `interval_secs` unless forced, and it never preempts: a shrink only lowers
//! `max_slots`, and in-flight tasks drain naturally.
//!
//! ```text
//! ratio < shrink_below && max_slots > max(min_slots, consumers / 2)
//!     => max_slots = max(ceil(max_slots * ratio), min_slots)
//! ratio > grow_above && max_slots < consumers
//!     => max_slots += 1
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Source of per-worker CPU usage.
///
/// Each call to [`sample`](CpuSampler::sample) reports, for every monitored
/// worker process, the CPU percent used since the previous call (100 = one
/// full core). How this is measured is up to the implementation.
pub trait CpuSampler: Send {
    /// Reset accounting baselines so the next sample starts from now.
    fn prime(&mut self) {}

    /// CPU percent per monitored worker since the previous call.
    fn sample(&mut self) -> Vec<f64>;
}

/// Sampler that never reports usage; the controller then never adjusts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSampler;

impl CpuSampler for NoSampler {
    fn sample(&mut self) -> Vec<f64> {
        Vec::new()
    }
}

impl<F> CpuSampler for F
where
    F: FnMut() -> Vec<f64> + Send,
{
    fn sample(&mut self) -> Vec<f64> {
        self()
    }
}

/// Time source for rate limiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used by simulations and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Instant::now()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Configuration knobs for the feedback controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerKnobs {
    /// Minimum seconds between two unforced evaluations.
    /// Default: 60
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Utilization ratio below which the budget shrinks.
    /// Default: 0.95
    #[serde(default = "default_shrink_below")]
    pub shrink_below: f64,

    /// Utilization ratio above which the budget grows by one.
    /// Default: 1.10
    #[serde(default = "default_grow_above")]
    pub grow_above: f64,

    /// Floor the budget never shrinks below.
    /// Default: 2
    #[serde(default = "default_min_slots")]
    pub min_slots: usize,

    /// Guard against division by zero in ratios.
    /// Default: 1e-6
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_shrink_below() -> f64 {
    0.95
}

fn default_grow_above() -> f64 {
    1.10
}

fn default_min_slots() -> usize {
    2
}

fn default_epsilon() -> f64 {
    1e-6
}

impl Default for ControllerKnobs {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            shrink_below: default_shrink_below(),
            grow_above: default_grow_above(),
            min_slots: default_min_slots(),
            epsilon: default_epsilon(),
        }
    }
}

impl ControllerKnobs {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Builder method to set the evaluation interval.
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Builder method to set the hysteresis band.
    pub fn with_band(mut self, shrink_below: f64, grow_above: f64) -> Self {
        self.shrink_below = shrink_below;
        self.grow_above = grow_above;
        self
    }
}

/// Aggregate worker utilization relative to what the running slots should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct WorkerUsage {
    /// Workers reporting nonzero usage.
    pub active: usize,
    /// 1.0 means workers use exactly the CPU their slots entitle them to.
    pub ratio: f64,
}

/// Compute [`WorkerUsage`] from raw per-worker percentages.
pub fn worker_usage(samples: &[f64], slots_running: usize, consumers: usize, epsilon: f64) -> WorkerUsage {
    let expected = slots_running as f64 / consumers.max(1) as f64;
    let ratios: Vec<f64> = samples
        .iter()
        .map(|pct| (pct / 100.0) / (expected + epsilon))
        .filter(|ratio| *ratio > 0.0)
        .collect();
    if ratios.is_empty() {
        return WorkerUsage::default();
    }
    let active = ratios.len();
    let denom = slots_running.max(active) as f64 + epsilon;
    WorkerUsage {
        active,
        ratio: ratios.iter().sum::<f64>() / denom,
    }
}

/// Budget state the controller reasons about.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    pub max_slots: usize,
    pub slots_running: usize,
    pub consumers: usize,
}

/// Outcome of one controller evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    /// Called again before the interval elapsed.
    RateLimited,
    /// No worker reported usage.
    NoSignal,
    /// A previous shrink is still draining.
    Draining { excess: usize },
    Shrink { ratio: f64, from: usize, to: usize },
    Grow { ratio: f64, from: usize, to: usize },
    /// Ratio inside the band or budget already at a limit.
    Hold { ratio: f64 },
}

/// Rate-limited, hysteresis-banded budget controller.
pub struct FeedbackController {
    knobs: ControllerKnobs,
    sampler: Box<dyn CpuSampler>,
    last_coop_time: Option<Instant>,
}

impl FeedbackController {
    pub fn new(knobs: ControllerKnobs, sampler: Box<dyn CpuSampler>) -> Self {
        Self {
            knobs,
            sampler,
            last_coop_time: None,
        }
    }

    pub fn knobs(&self) -> &ControllerKnobs {
        &self.knobs
    }

    pub fn last_coop_time(&self) -> Option<Instant> {
        self.last_coop_time
    }

    /// Initialize the evaluation timestamp if it was never set.
    pub fn touch(&mut self, now: Instant) {
        self.last_coop_time.get_or_insert(now);
    }

    /// Restart the interval and CPU accounting from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_coop_time = Some(now);
        self.sampler.prime();
    }

    /// Sample worker usage without touching the budget.
    pub fn usage(&mut self, slots_running: usize, consumers: usize) -> WorkerUsage {
        let samples = self.sampler.sample();
        for pct in &samples {
            debug!(cpu_pct = *pct, "worker CPU usage");
        }
        worker_usage(&samples, slots_running, consumers, self.knobs.epsilon)
    }

    /// Evaluate the budget.
    ///
    /// Returns the decision and, when a sample was taken, the usage it was
    /// based on.
    pub fn evaluate(&mut self, now: Instant, force: bool, budget: Budget) -> (Adjustment, Option<WorkerUsage>) {
        let last = *self.last_coop_time.get_or_insert(now);
        if !force && now.saturating_duration_since(last) < self.knobs.interval() {
            return (Adjustment::RateLimited, None);
        }
        self.last_coop_time = Some(now);

        let usage = self.usage(budget.slots_running, budget.consumers);
        (self.decide(usage, budget), Some(usage))
    }

    fn decide(&self, usage: WorkerUsage, budget: Budget) -> Adjustment {
        let Budget {
            max_slots,
            slots_running,
            consumers,
        } = budget;
        let ratio = usage.ratio;

        if usage.active == 0 || ratio == 0.0 {
            return Adjustment::NoSignal;
        }
        if slots_running > max_slots {
            return Adjustment::Draining {
                excess: slots_running - max_slots,
            };
        }

        let min_slots = self.knobs.min_slots;
        if ratio < self.knobs.shrink_below && max_slots > min_slots.max(consumers / 2) {
            let to = ((max_slots as f64 * ratio).ceil() as usize).max(min_slots);
            if to != max_slots {
                return Adjustment::Shrink {
                    ratio,
                    from: max_slots,
                    to,
                };
            }
        } else if ratio > self.knobs.grow_above && max_slots < consumers {
            return Adjustment::Grow {
                ratio,
                from: max_slots,
                to: max_slots + 1,
            };
        }
        Adjustment::Hold { ratio }
    }
}

impl std::fmt::Debug for FeedbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackController")
            .field("knobs", &self.knobs)
            .field("last_coop_time", &self.last_coop_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(samples: Vec<f64>) -> FeedbackController {
        FeedbackController::new(ControllerKnobs::default(), Box::new(move || samples.clone()))
    }

    fn budget(max_slots: usize, slots_running: usize) -> Budget {
        Budget {
            max_slots,
            slots_running,
            consumers: 8,
        }
    }

    #[test]
    fn test_worker_usage_no_signal() {
        assert_eq!(worker_usage(&[], 4, 8, 1e-6), WorkerUsage::default());
        assert_eq!(worker_usage(&[0.0, 0.0], 4, 8, 1e-6).active, 0);
    }

    #[test]
    fn test_worker_usage_saturated() {
        // 4 slots on 8 consumers: each worker is expected at 50%.
        let usage = worker_usage(&[50.0, 50.0, 50.0, 50.0], 4, 8, 1e-6);
        assert_eq!(usage.active, 4);
        assert!((usage.ratio - 1.0).abs() < 1e-3, "ratio={}", usage.ratio);
    }

    #[test]
    fn test_worker_usage_idle_workers_ignored() {
        let usage = worker_usage(&[50.0, 0.0, 50.0], 2, 8, 1e-6);
        assert_eq!(usage.active, 2);
    }

    #[test]
    fn test_rate_limited_without_force() {
        let mut c = controller(vec![10.0; 8]);
        let t0 = Instant::now();
        c.touch(t0);

        let (adj, usage) = c.evaluate(t0 + Duration::from_secs(30), false, budget(8, 8));
        assert_eq!(adj, Adjustment::RateLimited);
        assert!(usage.is_none());

        let (adj, _) = c.evaluate(t0 + Duration::from_secs(61), false, budget(8, 8));
        assert!(matches!(adj, Adjustment::Shrink { .. }));

        let (adj, _) = c.evaluate(t0 + Duration::from_secs(62), false, budget(8, 8));
        assert_eq!(adj, Adjustment::RateLimited);
    }

    #[test]
    fn test_first_evaluation_initializes_timestamp() {
        let mut c = controller(vec![100.0; 8]);
        assert!(c.last_coop_time().is_none());
        let t0 = Instant::now();
        let (adj, _) = c.evaluate(t0, false, budget(8, 8));
        assert_eq!(adj, Adjustment::RateLimited);
        assert_eq!(c.last_coop_time(), Some(t0));
    }

    #[test]
    fn test_force_bypasses_interval() {
        let mut c = controller(vec![10.0; 8]);
        let t0 = Instant::now();
        c.touch(t0);
        let (adj, usage) = c.evaluate(t0, true, budget(8, 8));
        assert!(usage.is_some());
        assert!(matches!(adj, Adjustment::Shrink { from: 8, .. }));
    }

    #[test]
    fn test_shrink_to_ceil_of_ratio() {
        let c = controller(vec![]);
        let usage = WorkerUsage {
            active: 8,
            ratio: 0.5,
        };
        assert_eq!(
            c.decide(usage, budget(8, 8)),
            Adjustment::Shrink {
                ratio: 0.5,
                from: 8,
                to: 4
            }
        );
    }

    #[test]
    fn test_reset_primes_and_restarts_interval() {
        struct Priming(Arc<Mutex<usize>>);

        impl CpuSampler for Priming {
            fn prime(&mut self) {
                *self.0.lock() += 1;
            }

            fn sample(&mut self) -> Vec<f64> {
                vec![10.0; 8]
            }
        }

        let primes = Arc::new(Mutex::new(0));
        let mut c = FeedbackController::new(
            ControllerKnobs::default(),
            Box::new(Priming(primes.clone())),
        );
        let t0 = Instant::now();
        c.touch(t0);

        let later = t0 + Duration::from_secs(61);
        c.reset(later);
        assert_eq!(*primes.lock(), 1);
        assert_eq!(c.last_coop_time(), Some(later));
        let (adj, _) = c.evaluate(later + Duration::from_secs(1), false, budget(8, 8));
        assert_eq!(adj, Adjustment::RateLimited);
    }

    #[test]
    fn test_shrink_floor_protected() {
        let c = controller(vec![]);
        let usage = WorkerUsage {
            active: 1,
            ratio: 0.1,
        };
        // max_slots already at consumers / 2: no shrink.
        assert_eq!(c.decide(usage, budget(4, 4)), Adjustment::Hold { ratio: 0.1 });
        // From 5 the floor is min_slots.
        assert_eq!(
            c.decide(usage, budget(5, 5)),
            Adjustment::Shrink {
                ratio: 0.1,
                from: 5,
                to: 2
            }
        );
    }

    #[test]
    fn test_grow_by_one_until_consumers() {
        let c = controller(vec![]);
        let usage = WorkerUsage {
            active: 4,
            ratio: 1.5,
        };
        assert_eq!(
            c.decide(usage, budget(6, 6)),
            Adjustment::Grow {
                ratio: 1.5,
                from: 6,
                to: 7
            }
        );
        assert_eq!(c.decide(usage, budget(8, 8)), Adjustment::Hold { ratio: 1.5 });
    }

    #[test]
    fn test_draining_blocks_adjustment() {
        let c = controller(vec![]);
        let usage = WorkerUsage {
            active: 4,
            ratio: 0.2,
        };
        assert_eq!(c.decide(usage, budget(4, 7)), Adjustment::Draining { excess: 3 });
    }

    #[test]
    fn test_no_signal() {
        let mut c = controller(vec![]);
        let (adj, usage) = c.evaluate(Instant::now(), true, budget(8, 8));
        assert_eq!(adj, Adjustment::NoSignal);
        assert_eq!(usage, Some(WorkerUsage::default()));
    }

    #[test]
    fn test_inside_band_holds() {
        let c = controller(vec![]);
        let usage = WorkerUsage {
            active: 8,
            ratio: 1.0,
        };
        assert_eq!(c.decide(usage, budget(6, 6)), Adjustment::Hold { ratio: 1.0 });
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - t0, Duration::from_secs(90));
    }

    #[test]
    fn test_knobs_deserialize() {
        let knobs: ControllerKnobs = toml::from_str("interval_secs = 5").unwrap();
        assert_eq!(knobs.interval(), Duration::from_secs(5));
        assert!((knobs.shrink_below - 0.95).abs() < 1e-12);
        assert_eq!(knobs.min_slots, 2);
    }
}
