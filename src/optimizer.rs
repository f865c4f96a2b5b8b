//! Task-config optimizer.
//!
//! Splits a slot budget into `tasks × validation × estimator` parallelism so
//! the product fills the budget as closely as possible without exceeding it
//! or any of the three bounds.
//!
//! Budgets never exceed the consumer count, so the integer lattice is small
//! enough to search exactly. The search starts from the corner a continuous
//! relaxation would be seeded at (one task, maximal inner parallelism), so
//! among equally good splits the one with the fewest tasks and the most
//! validation parallelism wins.

use serde::Serialize;

use crate::error::{Result, SchedError};

/// Chosen parallelism split for one strategy in one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TaskConfig {
    /// Number of tasks to dispatch.
    pub tasks: usize,
    /// Parallelism of each task's validation loop.
    pub validation_parallelism: usize,
    /// Threads available to each task's estimator.
    pub estimator_parallelism: usize,
}

impl TaskConfig {
    /// Slots charged per dispatched task.
    pub fn per_task_cost(&self) -> usize {
        self.validation_parallelism * self.estimator_parallelism
    }

    /// Slots charged if every task is dispatched.
    pub fn total(&self) -> usize {
        self.tasks * self.per_task_cost()
    }
}

/// Find the feasible split with the largest product not above `budget`.
///
/// Bounds are signed because they come out of [`resolve_bound`]; anything
/// below 1 makes the problem infeasible.
///
/// ```
/// use war_scheduler::optimizer::solve;
///
/// let cfg = solve(8, 4, 4, 4).unwrap();
/// assert_eq!(cfg.total(), 8);
/// ```
///
/// # Errors
///
/// Returns [`SchedError::InfeasibleConfig`] when no split exists, i.e. the
/// budget is zero or some bound is below 1.
///
/// [`resolve_bound`]: crate::strategy::resolve_bound
pub fn solve(
    budget: usize,
    max_tasks: i64,
    max_validation: i64,
    max_estimator: i64,
) -> Result<TaskConfig> {
    let infeasible = || SchedError::InfeasibleConfig {
        budget,
        max_tasks,
        max_validation,
        max_estimator,
    };
    if budget == 0 || max_tasks < 1 || max_validation < 1 || max_estimator < 1 {
        return Err(infeasible());
    }

    // No single factor can usefully exceed the budget.
    let cap = |bound: i64| (bound as u64).min(budget as u64) as usize;
    let (max_p, max_c, max_e) = (cap(max_tasks), cap(max_validation), cap(max_estimator));

    let mut best: Option<TaskConfig> = None;
    for p in 1..=max_p {
        let c_hi = max_c.min(budget / p);
        for c in (1..=c_hi).rev() {
            let e = max_e.min(budget / (p * c));
            let candidate = TaskConfig {
                tasks: p,
                validation_parallelism: c,
                estimator_parallelism: e,
            };
            if best.map_or(true, |b| candidate.total() > b.total()) {
                best = Some(candidate);
                if candidate.total() == budget {
                    return Ok(candidate);
                }
            }
        }
    }
    best.ok_or_else(infeasible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_best(budget: usize, p: usize, c: usize, e: usize) -> usize {
        let mut best = 0;
        for a in 1..=p {
            for b in 1..=c {
                for d in 1..=e {
                    let t = a * b * d;
                    if t <= budget && t > best {
                        best = t;
                    }
                }
            }
        }
        best
    }

    #[test]
    fn test_fills_budget_exactly() {
        let cfg = solve(8, 4, 4, 4).unwrap();
        assert_eq!(cfg.total(), 8);
        assert!(cfg.tasks <= 4 && cfg.validation_parallelism <= 4 && cfg.estimator_parallelism <= 4);
    }

    #[test]
    fn test_prefers_fewest_tasks() {
        let cfg = solve(8, 4, 4, 4).unwrap();
        assert_eq!(
            cfg,
            TaskConfig {
                tasks: 1,
                validation_parallelism: 4,
                estimator_parallelism: 2,
            }
        );
    }

    #[test]
    fn test_prime_budget_falls_short() {
        // 7 is prime and every bound is below it.
        let cfg = solve(7, 4, 4, 4).unwrap();
        assert_eq!(cfg.total(), 6);
    }

    #[test]
    fn test_single_threaded_strategy() {
        let cfg = solve(5, 1, 8, 1).unwrap();
        assert_eq!(cfg.tasks, 1);
        assert_eq!(cfg.validation_parallelism, 5);
        assert_eq!(cfg.estimator_parallelism, 1);
        assert_eq!(cfg.per_task_cost(), 5);
    }

    #[test]
    fn test_bounds_larger_than_budget() {
        let cfg = solve(3, 64, 64, 64).unwrap();
        assert_eq!(cfg.total(), 3);
    }

    #[test]
    fn test_infeasible() {
        assert!(matches!(
            solve(0, 4, 4, 4),
            Err(SchedError::InfeasibleConfig { budget: 0, .. })
        ));
        assert!(solve(4, 0, 4, 4).is_err());
        assert!(solve(4, 4, -1, 4).is_err());
        assert!(solve(4, 4, 4, 0).is_err());
    }

    #[test]
    fn test_matches_exhaustive_search() {
        for budget in 1..=24 {
            for p in 1..=5 {
                for c in 1..=5 {
                    for e in 1..=5 {
                        let cfg = solve(budget, p as i64, c as i64, e as i64).unwrap();
                        assert!(cfg.tasks >= 1 && cfg.tasks <= p);
                        assert!(cfg.validation_parallelism >= 1 && cfg.validation_parallelism <= c);
                        assert!(cfg.estimator_parallelism >= 1 && cfg.estimator_parallelism <= e);
                        assert!(cfg.total() <= budget);
                        assert_eq!(
                            cfg.total(),
                            brute_force_best(budget, p, c, e),
                            "budget={budget} bounds=({p},{c},{e})"
                        );
                    }
                }
            }
        }
    }
}
