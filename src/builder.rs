//! Builder for constructing schedulers.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use std::path::Path;
use std::sync::Arc;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;

use crate::bandit::{AllocationMode, BanditKnobs};
use crate::config::{InfeasiblePolicy, SchedulerConfig};
use crate::controller::{Clock, ControllerKnobs, CpuSampler, NoSampler, SystemClock};
use crate::error::Result;
use crate::events::{EventSink, LogSink};
use crate::scheduler::{Registration, Scheduler};

/// Builder for constructing a [`Scheduler`].
///
/// Configuration sources are merged in the following order (later sources
/// override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides and CLI arguments, in call order
///
/// The CPU sampler, clock and event sink are not configuration; they are
/// injected directly and default to [`NoSampler`], [`SystemClock`] and
/// [`LogSink`].
///
/// # Examples
///
/// ```ignore
/// use war_scheduler::{Registration, SchedulerBuilder};
///
/// let scheduler = SchedulerBuilder::new()
///     .file("war.toml")
///     .env_prefix("WAR")
///     .consumers(8)
///     .cooperate(true)
///     .cpu_sampler(pool_sampler)
///     .build(vec![Registration::new(nb), Registration::new(svm)])?;
/// ```
pub struct SchedulerBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
    sampler: Option<Box<dyn CpuSampler>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .field("sampler", &self.sampler.as_ref().map(|_| "<CpuSampler>"))
            .field("clock", &self.clock.as_ref().map(|_| "<Clock>"))
            .field("sink", &self.sink.as_ref().map(|_| "<EventSink>"))
            .finish()
    }
}

impl SchedulerBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(SchedulerConfig::default())),
            prometheus_registry: None,
            sampler: None,
            clock: None,
            sink: None,
        }
    }

    fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.figment = self.figment.merge(Serialized::default(key, value));
        self
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension, TOML
    /// otherwise). Files are merged in the order they are added.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}`; nested knobs use a double
    /// underscore, e.g. `WAR_MAX_SLOTS` or `WAR_CONTROLLER__INTERVAL_SECS`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self
            .figment
            .merge(Env::prefixed(&format!("{prefix}_")).split("__"));
        self
    }

    /// Set the number of CPU consumers.
    pub fn consumers(self, n: usize) -> Self {
        self.set("consumers", n)
    }

    /// Set the CPU set the workers run on; sizes the consumer count when
    /// `consumers` is not set.
    pub fn cpuset(self, cpuset: impl Into<String>) -> Self {
        self.set("cpuset", cpuset.into())
    }

    /// Set the initial slot limit.
    pub fn max_slots(self, n: usize) -> Self {
        self.set("max_slots", n)
    }

    /// Set the validation-parallelism bound (non-positive: offset from
    /// consumers).
    pub fn max_threads_per_evaluation(self, n: i64) -> Self {
        self.set("max_threads_per_evaluation", n)
    }

    /// Start with cooperation mode on or off.
    pub fn cooperate(self, enabled: bool) -> Self {
        self.set("cooperate", enabled)
    }

    pub fn allocation(self, mode: AllocationMode) -> Self {
        self.set("allocation", mode)
    }

    pub fn on_infeasible(self, policy: InfeasiblePolicy) -> Self {
        self.set("on_infeasible", policy)
    }

    /// Seed slot allocation for reproducible runs.
    pub fn seed(self, seed: u64) -> Self {
        self.set("seed", seed)
    }

    /// Set the minimum number of finished tasks between periodic reports.
    pub fn report_every(self, n: u64) -> Self {
        self.set("report_every", n)
    }

    /// Set the prefix of exported metric names.
    pub fn metrics_prefix(self, prefix: impl Into<String>) -> Self {
        self.set("metrics_prefix", prefix.into())
    }

    /// Set the bandit scoring knobs.
    pub fn bandit_knobs(self, knobs: BanditKnobs) -> Self {
        self.set("bandit", knobs)
    }

    /// Set the feedback controller knobs.
    ///
    /// ```ignore
    /// let builder = SchedulerBuilder::new()
    ///     .controller_knobs(ControllerKnobs::default().with_interval_secs(10));
    /// ```
    pub fn controller_knobs(self, knobs: ControllerKnobs) -> Self {
        self.set("controller", knobs)
    }

    /// Provide an external Prometheus registry for metrics exposition.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Source of per-worker CPU usage for the feedback controller.
    pub fn cpu_sampler(mut self, sampler: impl CpuSampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Time source for the controller interval.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Receiver of scheduler events.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// Only values present on the command line are applied.
    pub fn with_cli_args(mut self, args: &SchedulerArgs) -> Self {
        if let Some(n) = args.war_consumers {
            self = self.consumers(n);
        }
        if let Some(ref cpuset) = args.war_cpuset {
            self = self.cpuset(cpuset.clone());
        }
        if let Some(n) = args.war_max_slots {
            self = self.max_slots(n);
        }
        if let Some(n) = args.war_max_threads_per_evaluation {
            self = self.max_threads_per_evaluation(n);
        }
        if args.war_cooperate {
            self = self.cooperate(true);
        }
        if let Some(mode) = args.war_allocation {
            self = self.allocation(mode);
        }
        if let Some(policy) = args.war_on_infeasible {
            self = self.on_infeasible(policy);
        }
        if let Some(seed) = args.war_seed {
            self = self.seed(seed);
        }
        self
    }

    /// Extract the merged configuration without building.
    ///
    /// # Errors
    ///
    /// Returns an error if any source fails to parse or has the wrong shape.
    pub fn config(&self) -> Result<SchedulerConfig> {
        let mut config: SchedulerConfig = self.figment.extract().map_err(Box::new)?;
        config.prometheus_registry = self.prometheus_registry.clone();
        Ok(config)
    }

    /// Build the scheduler over `registrations`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction fails
    /// - The cpuset, consumer count or slot limit is invalid
    /// - No strategy is registered, or two share a name
    /// - Metrics registration fails
    pub fn build<P>(self, registrations: Vec<Registration<P>>) -> Result<Scheduler<P>> {
        let config = self.config()?;
        Scheduler::from_config(
            config,
            registrations,
            self.sampler.unwrap_or_else(|| Box::new(NoSampler)),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.sink.unwrap_or_else(|| Arc::new(LogSink)),
        )
    }
}

/// CLI arguments for scheduler configuration.
///
/// Use with clap's `Parser` derive macro and apply with
/// [`SchedulerBuilder::with_cli_args`].
///
/// ```ignore
/// use clap::Parser;
/// use war_scheduler::{SchedulerArgs, SchedulerBuilder};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     war: SchedulerArgs,
/// }
///
/// let args = MyArgs::parse();
/// let scheduler = SchedulerBuilder::new()
///     .with_cli_args(&args.war)
///     .build(strategies)?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct SchedulerArgs {
    /// Number of CPU consumers
    #[arg(long)]
    pub war_consumers: Option<usize>,

    /// CPU set (e.g., "0-7,16-23")
    #[arg(long)]
    pub war_cpuset: Option<String>,

    /// Initial slot limit
    #[arg(long)]
    pub war_max_slots: Option<usize>,

    /// Validation parallelism bound (non-positive: offset from consumers)
    #[arg(long, allow_hyphen_values = true)]
    pub war_max_threads_per_evaluation: Option<i64>,

    /// Start with cooperation mode enabled
    #[arg(long)]
    pub war_cooperate: bool,

    /// Slot allocation mode
    #[arg(long, value_enum)]
    pub war_allocation: Option<AllocationMode>,

    /// Reaction to an unsplittable slot share
    #[arg(long, value_enum)]
    pub war_on_infeasible: Option<InfeasiblePolicy>,

    /// Seed for slot allocation
    #[arg(long)]
    pub war_seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        war: SchedulerArgs,
    }

    #[test]
    fn test_builder_defaults() {
        let config = SchedulerBuilder::new().config().unwrap();
        assert!(config.consumers.is_none());
        assert!(config.cpuset.is_none());
        assert!(config.max_slots.is_none());
        assert_eq!(config.report_every, 100);
        assert_eq!(config.controller.interval_secs, 60);
    }

    #[test]
    fn test_builder_programmatic_override() {
        let config = SchedulerBuilder::new()
            .consumers(8)
            .cpuset("0-7")
            .max_slots(6)
            .max_threads_per_evaluation(-2)
            .allocation(AllocationMode::Multinomial)
            .controller_knobs(ControllerKnobs::default().with_interval_secs(5))
            .config()
            .unwrap();

        assert_eq!(config.consumers, Some(8));
        assert_eq!(config.cpuset.as_deref(), Some("0-7"));
        assert_eq!(config.max_slots, Some(6));
        assert_eq!(config.validation_bound(8), 6);
        assert_eq!(config.allocation, AllocationMode::Multinomial);
        assert_eq!(config.controller.interval_secs, 5);
    }

    #[test]
    fn test_builder_cli_args() {
        let cli = Cli::parse_from([
            "prog",
            "--war-consumers",
            "4",
            "--war-max-threads-per-evaluation",
            "-1",
            "--war-cooperate",
            "--war-allocation",
            "multinomial",
            "--war-on-infeasible",
            "abort",
        ]);

        let config = SchedulerBuilder::new()
            .consumers(16)
            .seed(3)
            .with_cli_args(&cli.war)
            .config()
            .unwrap();

        // CLI args override programmatic values; absent ones leave them be.
        assert_eq!(config.consumers, Some(4));
        assert_eq!(config.max_threads_per_evaluation, -1);
        assert!(config.cooperate);
        assert_eq!(config.allocation, AllocationMode::Multinomial);
        assert_eq!(config.on_infeasible, InfeasiblePolicy::Abort);
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn test_builder_file() {
        let path = std::env::temp_dir().join(format!("war-builder-{}.toml", std::process::id()));
        std::fs::write(&path, "consumers = 12\n[bandit]\nwarm_up_factor = 3.0\n").unwrap();

        let config = SchedulerBuilder::new()
            .file(&path)
            .max_slots(10)
            .config()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.consumers, Some(12));
        assert_eq!(config.max_slots, Some(10));
        assert!((config.bandit.warm_up_factor - 3.0).abs() < 1e-12);
        assert!((config.bandit.epsilon - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn test_builder_env() {
        std::env::set_var("WARBUILDERTEST_MAX_SLOTS", "3");
        std::env::set_var("WARBUILDERTEST_CONTROLLER__MIN_SLOTS", "1");
        let config = SchedulerBuilder::new()
            .env_prefix("WARBUILDERTEST")
            .config()
            .unwrap();
        assert_eq!(config.max_slots, Some(3));
        assert_eq!(config.controller.min_slots, 1);
    }

    #[test]
    fn test_build_with_collaborators() {
        let registry = Registry::new();
        let scheduler = SchedulerBuilder::new()
            .consumers(2)
            .prometheus_registry(registry.clone())
            .cpu_sampler(|| vec![100.0, 100.0])
            .event_sink(Arc::new(|_: &crate::SchedulerEvent| {}))
            .build(vec![Registration::new(crate::FnStrategy::new(
                crate::StrategyParams::new("a"),
                |_: usize| -> std::result::Result<(), crate::ProduceError> { Ok(()) },
            ))])
            .unwrap();
        assert_eq!(scheduler.consumers(), 2);
        assert_eq!(scheduler.max_slots(), 2);
        assert!(registry
            .gather()
            .iter()
            .any(|f| f.get_name() == "war_max_slots"));
    }
}
