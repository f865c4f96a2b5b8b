//! Bandit selector: turns ledger scores into a sampling distribution and
//! spreads the free slot budget across strategies.
//!
//! # Scoring
//!
//! ```text
//! raw        = best.avg * weight
//! normalized = (clip(raw, 0, 1) - lo) / (hi - lo)
//! bonus      = warm_up_factor * (warm_up - finished)
//! weight     = max(0, max(normalized + eps, bonus))
//! ```
//!
//! `lo`/`hi` range over non-exhausted strategies with floors at 0 and 1, so
//! the range is never degenerate before the first task finishes. While a
//! strategy is still warming up the bonus dominates and forces exploration.
//! Exhausted or capped strategies get exactly zero; every other strategy
//! gets an extra `eps` so it keeps a nonzero chance at convergence.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ledger::LedgerEntry;
use crate::strategy::StrategyParams;

/// Knobs of the scoring rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanditKnobs {
    /// Floor added to normalized scores and to every eligible weight.
    /// Default: 1e-6
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Multiplier on the number of warm-up tasks still missing.
    /// Default: 2.0
    #[serde(default = "default_warm_up_factor")]
    pub warm_up_factor: f64,
}

fn default_epsilon() -> f64 {
    1e-6
}

fn default_warm_up_factor() -> f64 {
    2.0
}

impl Default for BanditKnobs {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            warm_up_factor: default_warm_up_factor(),
        }
    }
}

/// How free slots are drawn from the distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMode {
    /// One uniform offset, evenly spaced draws. Same expected share as
    /// multinomial, but each strategy gets within one slot of `n * p`.
    #[default]
    Systematic,
    /// Independent categorical draws.
    Multinomial,
}

/// One strategy as seen by the selector.
pub type Arm<'a> = (&'a StrategyParams, &'a LedgerEntry);

/// Whether a strategy may receive slots at all.
pub fn is_eligible(params: &StrategyParams, entry: &LedgerEntry) -> bool {
    !entry.exhausted && !params.is_capped(entry.finished)
}

/// Sampling distribution over `arms`, in the same order.
///
/// Returns `None` when no strategy is eligible.
pub fn probabilities(arms: &[Arm<'_>], knobs: &BanditKnobs) -> Option<Vec<f64>> {
    let raw = |(params, entry): &Arm<'_>| entry.best.agg.avg * params.weight;

    let mut live = arms.iter().filter(|(_, entry)| !entry.exhausted).peekable();
    live.peek()?;
    let (lo, hi) = live.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), arm| {
        let r = raw(arm);
        (lo.min(r.max(0.0)), hi.max(r.max(1.0)))
    });
    let span = (hi - lo).max(knobs.epsilon);

    let mut weights = Vec::with_capacity(arms.len());
    let mut any = false;
    for arm in arms {
        let (params, entry) = *arm;
        if !is_eligible(params, entry) {
            weights.push(0.0);
            continue;
        }
        let normalized = (raw(arm).clamp(0.0, 1.0) - lo) / span;
        let bonus = knobs.warm_up_factor * (params.warm_up as f64 - entry.finished as f64);
        let w = (normalized + knobs.epsilon).max(bonus).max(0.0);
        let w = if w.is_finite() { w } else { 0.0 };
        weights.push(w + knobs.epsilon);
        any = true;
    }
    if !any {
        return None;
    }

    let total: f64 = weights.iter().sum();
    Some(weights.into_iter().map(|w| w / total).collect())
}

/// Draw `slots` slots from `probs` and count them per strategy.
pub fn allocate<R: Rng + ?Sized>(
    probs: &[f64],
    slots: usize,
    mode: AllocationMode,
    rng: &mut R,
) -> Vec<usize> {
    match mode {
        AllocationMode::Systematic => systematic(probs, slots, rng),
        AllocationMode::Multinomial => multinomial(probs, slots, rng),
    }
}

fn multinomial<R: Rng + ?Sized>(probs: &[f64], slots: usize, rng: &mut R) -> Vec<usize> {
    let mut counts = vec![0; probs.len()];
    let dist = match WeightedIndex::new(probs) {
        Ok(dist) => dist,
        Err(e) => {
            warn!(%e, "cannot sample from slot distribution");
            return counts;
        }
    };
    for _ in 0..slots {
        counts[dist.sample(rng)] += 1;
    }
    counts
}

fn systematic<R: Rng + ?Sized>(probs: &[f64], slots: usize, rng: &mut R) -> Vec<usize> {
    let mut counts = vec![0; probs.len()];
    let Some(last) = probs.iter().rposition(|&p| p > 0.0) else {
        return counts;
    };
    if slots == 0 {
        return counts;
    }

    let step = 1.0 / slots as f64;
    let mut point = rng.gen::<f64>() * step;
    let mut cumulative = 0.0;
    let mut i = 0;
    for _ in 0..slots {
        // Zero-probability entries are always skipped: cumulative <= point.
        while i < last && cumulative + probs[i] <= point {
            cumulative += probs[i];
            i += 1;
        }
        counts[i] += 1;
        point += step;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StrategyCache;
    use crate::strategy::StrategyId;
    use crate::task::ScoreRecord;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn arm(name: &str, avg: f64, finished: u64, warm_up: u64) -> (StrategyParams, LedgerEntry) {
        let params = StrategyParams::new(name).with_warm_up(warm_up);
        let entry = LedgerEntry::from_cache(
            StrategyId::from_name(name),
            name,
            StrategyCache {
                cumulative_time: 0.0,
                best: ScoreRecord::with_avg(avg),
                finished,
            },
        );
        (params, entry)
    }

    fn view(owned: &[(StrategyParams, LedgerEntry)]) -> Vec<Arm<'_>> {
        owned.iter().map(|(p, e)| (p, e)).collect()
    }

    fn assert_distribution(probs: &[f64]) {
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
        assert!(probs.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn test_warm_up_forces_equal_exploration() {
        let owned = vec![arm("a", 0.0, 0, 1), arm("b", 0.0, 0, 1)];
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert_distribution(&probs);
        assert!((probs[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_better_score_gets_more_mass() {
        let owned = vec![arm("good", 0.9, 50, 1), arm("bad", 0.2, 50, 1)];
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert_distribution(&probs);
        assert!(probs[0] > probs[1]);
        assert!(probs[1] > 0.0);
    }

    #[test]
    fn test_warm_up_beats_score() {
        let owned = vec![arm("veteran", 0.95, 100, 5), arm("rookie", 0.0, 0, 5)];
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn test_weight_scales_score() {
        let mut owned = vec![arm("a", 0.8, 10, 0), arm("b", 0.8, 10, 0)];
        owned[1].0.weight = 0.25;
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn test_exhausted_and_capped_get_zero() {
        let mut owned = vec![arm("live", 0.3, 2, 1), arm("done", 0.9, 2, 1), arm("capped", 0.9, 1, 1)];
        owned[1].1.exhausted = true;
        owned[2].0.max_tasks = Some(1);
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert_distribution(&probs);
        assert_eq!(probs[1], 0.0);
        assert_eq!(probs[2], 0.0);
        assert!((probs[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_eligible_strategy() {
        let mut owned = vec![arm("a", 0.3, 2, 1), arm("b", 0.3, 3, 1)];
        owned[0].1.exhausted = true;
        owned[1].0.max_tasks = Some(3);
        assert!(probabilities(&view(&owned), &BanditKnobs::default()).is_none());

        owned[1].1.exhausted = true;
        assert!(probabilities(&view(&owned), &BanditKnobs::default()).is_none());
    }

    #[test]
    fn test_scores_above_one_do_not_divide_by_zero() {
        let owned = vec![arm("a", 3.0, 10, 0), arm("b", 3.0, 10, 0)];
        let probs = probabilities(&view(&owned), &BanditKnobs::default()).unwrap();
        assert_distribution(&probs);
    }

    #[test]
    fn test_systematic_allocation_is_balanced() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            let counts = allocate(&[0.5, 0.5], 4, AllocationMode::Systematic, &mut rng);
            assert_eq!(counts, vec![2, 2]);
        }
    }

    #[test]
    fn test_systematic_respects_zero_mass() {
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..100 {
            let counts = allocate(&[0.0, 0.7, 0.0, 0.3, 0.0], 10, AllocationMode::Systematic, &mut rng);
            assert_eq!(counts.iter().sum::<usize>(), 10);
            assert_eq!(counts[0], 0);
            assert_eq!(counts[2], 0);
            assert_eq!(counts[4], 0);
            assert!((6..=8).contains(&counts[1]));
        }
    }

    #[test]
    fn test_multinomial_allocation() {
        let mut rng = SmallRng::seed_from_u64(3);
        let counts = allocate(&[0.25, 0.0, 0.75], 1000, AllocationMode::Multinomial, &mut rng);
        assert_eq!(counts.iter().sum::<usize>(), 1000);
        assert_eq!(counts[1], 0);
        assert!(counts[2] > counts[0]);
    }

    #[test]
    fn test_allocate_nothing() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(allocate(&[0.5, 0.5], 0, AllocationMode::Systematic, &mut rng), vec![0, 0]);
        assert_eq!(allocate(&[0.5, 0.5], 0, AllocationMode::Multinomial, &mut rng), vec![0, 0]);
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: AllocationMode = serde_json::from_str("\"multinomial\"").unwrap();
        assert_eq!(mode, AllocationMode::Multinomial);
    }
}
