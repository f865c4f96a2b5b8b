//! Drive the scheduler against a rayon worker pool with simulated work.
//!
//! Run with: RUST_LOG=info cargo run --example simulate -- --war-cooperate

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tracing_subscriber::EnvFilter;
use war_scheduler::{
    ControllerKnobs, FnStrategy, ProduceError, Registration, SchedulerArgs, SchedulerBuilder,
    StrategyParams, TaskResult,
};

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    war: SchedulerArgs,

    /// Total tasks to run before stopping
    #[arg(long, default_value_t = 200)]
    tasks: u64,
}

/// A simulated evaluation: mean score and duration.
#[derive(Clone, Debug)]
struct Work {
    quality: f64,
    millis: u64,
}

fn strategy(name: &str, quality: f64, limit: Option<u64>) -> Registration<Work> {
    let mut produced = 0u64;
    let params = StrategyParams::new(name).with_parallelism(0, 2).with_warm_up(3);
    Registration::new(FnStrategy::new(params, move |threads: usize| {
        if limit.is_some_and(|l| produced >= l) {
            return Err(ProduceError::Exhausted);
        }
        produced += 1;
        Ok(Work {
            quality,
            millis: 20 / threads.max(1) as u64 + 5,
        })
    }))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let busy = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let busy = busy.clone();
        // Each busy worker reports a full core, idle ones nothing.
        move || vec![100.0; busy.load(Ordering::Relaxed)]
    };

    let mut scheduler = SchedulerBuilder::new()
        .consumers(8)
        .controller_knobs(ControllerKnobs::default().with_interval_secs(1))
        .with_cli_args(&args.war)
        .cpu_sampler(sampler)
        .build(vec![
            strategy("naive bayes", 0.62, None),
            strategy("svm", 0.81, None),
            strategy("pca + svm", 0.78, Some(10)),
            strategy("random forest", 0.74, None),
        ])?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(scheduler.consumers())
        .thread_name(|i| format!("war-worker-{i:02}"))
        .build()?;
    let (tx, rx) = mpsc::channel::<TaskResult<Work>>();
    let started = Instant::now();

    while scheduler.tasks_finished() < args.tasks {
        for task in scheduler.next()? {
            let tx = tx.clone();
            let busy = busy.clone();
            pool.spawn(move || {
                busy.fetch_add(1, Ordering::Relaxed);
                let begin = Instant::now();
                let work = task.payload().clone();
                std::thread::sleep(Duration::from_millis(work.millis));
                let mut rng = rand::thread_rng();
                let scores: Vec<f64> = (0..task.n_jobs())
                    .map(|_| (work.quality + rng.gen_range(-0.05..0.05)).clamp(0.0, 1.0))
                    .collect();
                busy.fetch_sub(1, Ordering::Relaxed);
                // Receiver outlives every worker.
                let _ = tx.send(TaskResult::success(task, begin.elapsed(), scores));
            });
        }

        let result = rx.recv_timeout(Duration::from_secs(5))?;
        scheduler.collect(result)?;
        while let Ok(result) = rx.try_recv() {
            scheduler.collect(result)?;
        }

        if let Some(report) = scheduler.take_report() {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    println!(
        "finished {} tasks in {:.2?}",
        scheduler.tasks_finished(),
        started.elapsed()
    );
    println!("{}", serde_json::to_string_pretty(&scheduler.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&scheduler.export_cache())?);
    Ok(())
}
