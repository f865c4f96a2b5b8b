//! Consumer counting from a Linux cpuset string (`"0-3,8-11"`, `"0,2,4"`).

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{Result, SchedError};

/// CPU ids named by a cpuset string, ascending and without duplicates.
///
/// ```
/// use war_scheduler::cpuset::parse_cpuset;
///
/// let cpus = parse_cpuset("8-11,0-3").unwrap();
/// assert_eq!(cpus, vec![0, 1, 2, 3, 8, 9, 10, 11]);
/// ```
///
/// # Errors
///
/// Returns `SchedError::InvalidCpuSet` for a malformed id, a descending
/// range, or a string naming no CPU.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let mut cpus = BTreeSet::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (first, last) = part.split_once('-').unwrap_or((part, part));
        let (first, last) = (cpu_id(first, part)?, cpu_id(last, part)?);
        if first > last {
            return Err(SchedError::InvalidCpuSet(format!("descending range '{part}'")));
        }
        cpus.extend(first..=last);
    }
    if cpus.is_empty() {
        return Err(SchedError::InvalidCpuSet(format!("no CPU in '{s}'")));
    }
    Ok(cpus.into_iter().collect())
}

fn cpu_id(field: &str, part: &str) -> Result<usize> {
    field
        .trim()
        .parse()
        .map_err(|_| SchedError::InvalidCpuSet(format!("bad CPU id in '{part}'")))
}

/// All logical CPU IDs visible to this process.
pub fn available_cpus() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Number of worker consumers for an optional cpuset.
///
/// With a cpuset the count is its size; without one it is the number of
/// CPUs `core_affinity` reports.
///
/// # Errors
///
/// Returns an error if the cpuset fails to parse or no CPU is visible.
pub fn consumer_count(cpuset: Option<&str>) -> Result<usize> {
    let count = match cpuset {
        Some(s) => parse_cpuset(s)?.len(),
        None => available_cpus().len(),
    };
    if count == 0 {
        return Err(SchedError::InvalidConsumers(
            "no CPUs available to size the worker pool".to_string(),
        ));
    }
    debug!(count, ?cpuset, "resolved consumer count");
    Ok(count)
}
