//! Sliding-window capacity math.
//!
//! Budget is reserved by the *estimated* demand of each task at the moment it
//! starts, not by metered usage. A burst of underestimated tasks can therefore
//! overshoot the nominal budget once responses come back; the admission check
//! is a precondition, not a runtime ceiling.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Default length of the rolling budget window.
pub const TOKEN_WINDOW: Duration = Duration::from_secs(60);

/// A task with this demand started at this instant on the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStartRecord {
    pub started_at: Instant,
    pub token_demand: u64,
}

impl TaskStartRecord {
    pub fn new(started_at: Instant, token_demand: u64) -> Self {
        Self {
            started_at,
            token_demand,
        }
    }
}

/// What a worker can accept right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub token_capacity: u64,
    pub models: BTreeSet<String>,
}

impl CapacitySnapshot {
    pub fn new(token_capacity: u64, models: BTreeSet<String>) -> Self {
        Self { token_capacity, models }
    }

    /// Whether a task with this demand and model set fits this snapshot.
    pub fn admits(&self, token_demand: u64, eligible_models: &BTreeSet<String>) -> bool {
        token_demand <= self.token_capacity && !self.models.is_disjoint(eligible_models)
    }
}

fn in_window(record: &TaskStartRecord, now: Instant, window: Duration) -> bool {
    match now.checked_sub(window) {
        Some(cutoff) => record.started_at >= cutoff,
        // Process younger than the window: nothing can have expired yet
        None => true,
    }
}

/// Drop records that started before `now - window`.
///
/// Records are appended in start order, so expired ones sit at the front.
pub fn prune(records: &mut VecDeque<TaskStartRecord>, now: Instant, window: Duration) {
    while let Some(front) = records.front() {
        if in_window(front, now, window) {
            break;
        }
        records.pop_front();
    }
}

/// Tokens still available in the window: `max(0, budget - sum(demand))`.
pub fn remaining_tokens<'a, I>(records: I, now: Instant, window: Duration, budget: u64) -> u64
where
    I: IntoIterator<Item = &'a TaskStartRecord>,
{
    let used: u64 = records
        .into_iter()
        .filter(|r| in_window(r, now, window))
        .map(|r| r.token_demand)
        .fold(0u64, u64::saturating_add);
    budget.saturating_sub(used)
}

/// Number of tasks started within the window.
pub fn requests_in_window<'a, I>(records: I, now: Instant, window: Duration) -> usize
where
    I: IntoIterator<Item = &'a TaskStartRecord>,
{
    records.into_iter().filter(|r| in_window(r, now, window)).count()
}
