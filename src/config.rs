//! Configuration types for the scheduler.

use prometheus::Registry;
use serde::{Deserialize, Serialize};

use crate::bandit::{AllocationMode, BanditKnobs};
use crate::controller::ControllerKnobs;
use crate::cpuset;
use crate::error::{Result, SchedError};
use crate::strategy::resolve_bound;

/// What `next()` does when a strategy's slot share cannot be split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InfeasiblePolicy {
    /// Emit an event and skip the strategy for this tick.
    #[default]
    Skip,
    /// Return the error from `next()`.
    Abort,
}

/// Configuration for a scheduler.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment
/// variables using figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Number of CPU consumers (worker pool size). Defaults to the size of
    /// `cpuset`, or every CPU on the machine.
    #[serde(default)]
    pub consumers: Option<usize>,

    /// CPU set string (e.g., "0-7,16-23") the workers are confined to.
    #[serde(default)]
    pub cpuset: Option<String>,

    /// Initial slot limit (default: `consumers`).
    #[serde(default)]
    pub max_slots: Option<usize>,

    /// Bound on validation parallelism per task. Non-positive values are
    /// offsets from `consumers` (default: 0, i.e. all consumers).
    #[serde(default)]
    pub max_threads_per_evaluation: i64,

    /// Run the feedback controller on every tick (default: false).
    #[serde(default)]
    pub cooperate: bool,

    /// How free slots are drawn (default: systematic).
    #[serde(default)]
    pub allocation: AllocationMode,

    /// Reaction to an unsplittable slot share (default: skip).
    #[serde(default)]
    pub on_infeasible: InfeasiblePolicy,

    /// Seed for slot allocation; `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Minimum finished tasks between two periodic reports (default: 100).
    #[serde(default = "default_report_every")]
    pub report_every: u64,

    /// Prefix of exported metric names (default: "war").
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,

    #[serde(default)]
    pub bandit: BanditKnobs,

    #[serde(default)]
    pub controller: ControllerKnobs,

    /// Prometheus registry for metrics exposition.
    /// Not serializable - must be set programmatically.
    #[serde(skip)]
    pub prometheus_registry: Option<Registry>,
}

fn default_report_every() -> u64 {
    100
}

fn default_metrics_prefix() -> String {
    "war".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            consumers: None,
            cpuset: None,
            max_slots: None,
            max_threads_per_evaluation: 0,
            cooperate: false,
            allocation: AllocationMode::default(),
            on_infeasible: InfeasiblePolicy::default(),
            seed: None,
            report_every: default_report_every(),
            metrics_prefix: default_metrics_prefix(),
            bandit: BanditKnobs::default(),
            controller: ControllerKnobs::default(),
            prometheus_registry: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the consumer count.
    ///
    /// An explicit `consumers` wins; otherwise the cpuset size, otherwise
    /// every CPU visible to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the cpuset does not parse or the count is zero.
    pub fn resolve_consumers(&self) -> Result<usize> {
        let consumers = match self.consumers {
            Some(n) => n,
            None => cpuset::consumer_count(self.cpuset.as_deref())?,
        };
        if consumers == 0 {
            return Err(SchedError::InvalidConsumers(
                "consumer count must be at least 1".to_string(),
            ));
        }
        Ok(consumers)
    }

    /// Initial slot limit for `consumers`.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_slots` is outside
    /// `slot_floor(consumers)..=consumers`.
    pub fn effective_max_slots(&self, consumers: usize) -> Result<usize> {
        let requested = self.max_slots.unwrap_or(consumers);
        check_slot_limit(requested, self.slot_floor(consumers), consumers)?;
        Ok(requested)
    }

    /// Smallest slot limit an operator may set: the controller's
    /// `min_slots`, unless the pool itself is smaller.
    pub fn slot_floor(&self, consumers: usize) -> usize {
        self.controller.min_slots.min(consumers).max(1)
    }

    /// Validation-parallelism bound handed to the optimizer.
    pub fn validation_bound(&self, consumers: usize) -> i64 {
        resolve_bound(self.max_threads_per_evaluation, consumers)
    }
}

/// Check a slot limit against `floor..=consumers`.
pub(crate) fn check_slot_limit(requested: usize, floor: usize, consumers: usize) -> Result<()> {
    if requested > consumers {
        return Err(SchedError::SlotLimitExceeded {
            requested,
            consumers,
        });
    }
    if requested < floor {
        return Err(SchedError::SlotLimitTooLow { requested, floor });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(config.consumers.is_none());
        assert!(config.max_slots.is_none());
        assert_eq!(config.max_threads_per_evaluation, 0);
        assert!(!config.cooperate);
        assert_eq!(config.allocation, AllocationMode::Systematic);
        assert_eq!(config.on_infeasible, InfeasiblePolicy::Skip);
        assert_eq!(config.report_every, 100);
        assert_eq!(config.metrics_prefix, "war");
    }

    #[test]
    fn test_resolve_consumers() {
        let mut config = SchedulerConfig::default();
        config.consumers = Some(6);
        assert_eq!(config.resolve_consumers().unwrap(), 6);

        config.consumers = None;
        config.cpuset = Some("0-3".to_string());
        assert_eq!(config.resolve_consumers().unwrap(), 4);

        config.consumers = Some(0);
        assert!(config.resolve_consumers().is_err());
    }

    #[test]
    fn test_effective_max_slots() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.effective_max_slots(8).unwrap(), 8);

        config.max_slots = Some(3);
        assert_eq!(config.effective_max_slots(8).unwrap(), 3);

        config.max_slots = Some(9);
        assert!(matches!(
            config.effective_max_slots(8),
            Err(SchedError::SlotLimitExceeded {
                requested: 9,
                consumers: 8
            })
        ));

        for low in [0, 1] {
            config.max_slots = Some(low);
            assert!(matches!(
                config.effective_max_slots(8),
                Err(SchedError::SlotLimitTooLow { floor: 2, .. })
            ));
        }
    }

    #[test]
    fn test_slot_floor_on_small_pools() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.slot_floor(8), 2);
        assert_eq!(config.slot_floor(1), 1);
        config.max_slots = Some(1);
        assert_eq!(config.effective_max_slots(1).unwrap(), 1);

        config.controller.min_slots = 0;
        assert_eq!(config.slot_floor(8), 1);
    }

    #[test]
    fn test_validation_bound() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.validation_bound(8), 8);
        config.max_threads_per_evaluation = -2;
        assert_eq!(config.validation_bound(8), 6);
        config.max_threads_per_evaluation = 3;
        assert_eq!(config.validation_bound(8), 3);
    }

    #[test]
    fn test_deserialize_config() {
        let toml = r#"
            consumers = 16
            max_slots = 12
            max_threads_per_evaluation = -4
            cooperate = true
            allocation = "multinomial"
            on_infeasible = "abort"
            seed = 42

            [controller]
            interval_secs = 30
        "#;

        let config: SchedulerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.consumers, Some(16));
        assert_eq!(config.max_slots, Some(12));
        assert_eq!(config.validation_bound(16), 12);
        assert!(config.cooperate);
        assert_eq!(config.allocation, AllocationMode::Multinomial);
        assert_eq!(config.on_infeasible, InfeasiblePolicy::Abort);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.controller.interval_secs, 30);
        assert!((config.controller.grow_above - 1.10).abs() < 1e-12);
    }
}
