//! Per-strategy bookkeeping owned by the scheduler.
//!
//! Each registered strategy gets one [`LedgerEntry`], seeded from the
//! [`StrategyCache`] the caller supplies and mutated only by the scheduler
//! while tasks are dispatched and collected.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::strategy::StrategyId;
use crate::task::ScoreRecord;

/// Historical values carried across sessions by the caller.
///
/// The scheduler never reads or writes storage; it accepts this shape at
/// construction and hands it back from `export_cache`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyCache {
    /// Seconds spent in finished tasks.
    #[serde(default)]
    pub cumulative_time: f64,
    #[serde(default)]
    pub best: ScoreRecord,
    #[serde(default)]
    pub finished: u64,
}

/// Bookkeeping for one strategy.
#[derive(Clone, Debug, Serialize)]
pub struct LedgerEntry {
    pub id: StrategyId,
    pub name: String,
    pub cumulative_time: Duration,
    /// Best record so far; only ever replaced by a strictly better one.
    pub best: ScoreRecord,
    pub finished: u64,
    pub running: usize,
    /// Slots consumed by this strategy's in-flight tasks.
    pub slots: usize,
    /// Sticky: never cleared within a session.
    pub exhausted: bool,
}

impl LedgerEntry {
    pub fn from_cache(id: StrategyId, name: impl Into<String>, cache: StrategyCache) -> Self {
        Self {
            id,
            name: name.into(),
            cumulative_time: Duration::from_secs_f64(cache.cumulative_time.max(0.0)),
            best: cache.best,
            finished: cache.finished,
            running: 0,
            slots: 0,
            exhausted: false,
        }
    }

    pub fn to_cache(&self) -> StrategyCache {
        StrategyCache {
            cumulative_time: self.cumulative_time.as_secs_f64(),
            best: self.best.clone(),
            finished: self.finished,
        }
    }

    /// Average duration of a finished task, if any finished.
    pub fn mean_time(&self) -> Option<Duration> {
        if self.finished == 0 {
            return None;
        }
        Some(self.cumulative_time.div_f64(self.finished as f64))
    }
}

/// All ledger entries, in registration order, addressable by id.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    index: HashMap<StrategyId, usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Fails if the id is already present.
    pub fn insert(&mut self, entry: LedgerEntry) -> Result<usize> {
        if self.index.contains_key(&entry.id) {
            return Err(SchedError::DuplicateStrategy(entry.name));
        }
        let pos = self.entries.len();
        self.index.insert(entry.id, pos);
        self.entries.push(entry);
        Ok(pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, pos: usize) -> Option<&LedgerEntry> {
        self.entries.get(pos)
    }

    pub fn position(&self, id: StrategyId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn by_id(&self, id: StrategyId) -> Option<&LedgerEntry> {
        self.position(id).map(|pos| &self.entries[pos])
    }

    /// Charge one dispatched task of `cost` slots to the entry at `pos`.
    pub(crate) fn charge(&mut self, pos: usize, cost: usize) {
        let entry = &mut self.entries[pos];
        entry.running += 1;
        entry.slots += cost;
    }

    /// Record one completion for `id`, releasing `jobs` slots.
    ///
    /// Returns the position of the entry so the caller can continue with
    /// score bookkeeping.
    pub(crate) fn release(&mut self, id: StrategyId, jobs: usize, elapsed: Duration) -> Result<usize> {
        let pos = self.position(id).ok_or(SchedError::NoSuchStrategy(id))?;
        let entry = &mut self.entries[pos];
        if entry.running == 0 || entry.slots < jobs {
            return Err(SchedError::StrategyUnderflow {
                strategy: id,
                running: entry.running,
                slots: entry.slots,
                released: jobs,
            });
        }
        entry.finished += 1;
        entry.running -= 1;
        entry.slots -= jobs;
        entry.cumulative_time += elapsed;
        Ok(pos)
    }

    pub(crate) fn mark_exhausted(&mut self, pos: usize) -> bool {
        let entry = &mut self.entries[pos];
        let newly = !entry.exhausted;
        entry.exhausted = true;
        newly
    }

    /// Replace the best record if `record` is strictly better.
    ///
    /// Returns the previous average on improvement.
    pub(crate) fn offer_best(&mut self, pos: usize, record: &ScoreRecord) -> Option<f64> {
        let entry = &mut self.entries[pos];
        if record.agg.avg > entry.best.agg.avg {
            let previous = entry.best.agg.avg;
            entry.best = record.clone();
            Some(previous)
        } else {
            None
        }
    }

    /// Sum of slots held by every strategy.
    pub fn total_slots(&self) -> usize {
        self.entries.iter().map(|e| e.slots).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger
            .insert(LedgerEntry::from_cache(
                StrategyId(1),
                "a",
                StrategyCache {
                    cumulative_time: 12.5,
                    best: ScoreRecord::with_avg(0.6),
                    finished: 3,
                },
            ))
            .unwrap();
        ledger
            .insert(LedgerEntry::from_cache(StrategyId(2), "b", StrategyCache::default()))
            .unwrap();
        ledger
    }

    #[test]
    fn test_seeded_from_cache() {
        let ledger = ledger();
        let a = ledger.by_id(StrategyId(1)).unwrap();
        assert_eq!(a.finished, 3);
        assert_eq!(a.running, 0);
        assert_eq!(a.slots, 0);
        assert!(!a.exhausted);
        assert!((a.best.agg.avg - 0.6).abs() < 1e-12);
        assert_eq!(a.cumulative_time, Duration::from_millis(12_500));
        assert_eq!(a.to_cache().finished, 3);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut ledger = ledger();
        let dup = LedgerEntry::from_cache(StrategyId(2), "b", StrategyCache::default());
        assert!(matches!(
            ledger.insert(dup),
            Err(SchedError::DuplicateStrategy(name)) if name == "b"
        ));
    }

    #[test]
    fn test_charge_and_release() {
        let mut ledger = ledger();
        ledger.charge(1, 4);
        ledger.charge(1, 2);
        assert_eq!(ledger.total_slots(), 6);
        assert_eq!(ledger.get(1).unwrap().running, 2);

        let pos = ledger
            .release(StrategyId(2), 4, Duration::from_secs(2))
            .unwrap();
        assert_eq!(pos, 1);
        let b = ledger.get(1).unwrap();
        assert_eq!(b.running, 1);
        assert_eq!(b.slots, 2);
        assert_eq!(b.finished, 1);
        assert_eq!(b.mean_time(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_release_unknown_strategy() {
        let mut ledger = ledger();
        assert!(matches!(
            ledger.release(StrategyId(99), 1, Duration::ZERO),
            Err(SchedError::NoSuchStrategy(StrategyId(99)))
        ));
    }

    #[test]
    fn test_release_more_than_held() {
        let mut ledger = ledger();
        ledger.charge(0, 1);
        assert!(matches!(
            ledger.release(StrategyId(1), 3, Duration::ZERO),
            Err(SchedError::StrategyUnderflow {
                running: 1,
                slots: 1,
                released: 3,
                ..
            })
        ));
        assert_eq!(ledger.get(0).unwrap().slots, 1);
    }

    #[test]
    fn test_release_with_nothing_running() {
        let mut ledger = ledger();
        assert!(matches!(
            ledger.release(StrategyId(1), 0, Duration::ZERO),
            Err(SchedError::StrategyUnderflow {
                running: 0,
                slots: 0,
                released: 0,
                ..
            })
        ));
        assert_eq!(ledger.get(0).unwrap().finished, 3);
    }

    #[test]
    fn test_best_never_regresses() {
        let mut ledger = ledger();
        assert_eq!(ledger.offer_best(0, &ScoreRecord::with_avg(0.5)), None);
        assert_eq!(ledger.offer_best(0, &ScoreRecord::with_avg(0.6)), None);
        assert_eq!(ledger.offer_best(0, &ScoreRecord::with_avg(0.7)), Some(0.6));
        assert!((ledger.get(0).unwrap().best.agg.avg - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let mut ledger = ledger();
        assert!(ledger.mark_exhausted(0));
        assert!(!ledger.mark_exhausted(0));
        assert!(ledger.get(0).unwrap().exhausted);
    }
}
