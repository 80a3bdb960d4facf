//! Per-insertion work budget.
//!
//! Not a wall clock: the tree charges operations as it ages and aggregates
//! entries, and checks `has_more_time` at fixed points of the descent. Once
//! exhausted, the insertion parks the point in the nearest entry's buffer
//! instead of descending further.

use crate::constants::DEFAULT_BUDGET;

pub trait Budget {
    /// Whether the insertion may keep descending.
    fn has_more_time(&self) -> bool;

    /// Charge `ops` operations.
    fn spend(&mut self, ops: u64);
}

/// Fixed operation counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimpleBudget {
    remaining: u64,
}

impl SimpleBudget {
    pub fn new(ops: u64) -> Self {
        Self { remaining: ops }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Default for SimpleBudget {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

impl Budget for SimpleBudget {
    fn has_more_time(&self) -> bool {
        self.remaining > 0
    }

    fn spend(&mut self, ops: u64) {
        self.remaining = self.remaining.saturating_sub(ops);
    }
}

/// Budget that never runs out.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlimitedBudget;

impl Budget for UnlimitedBudget {
    fn has_more_time(&self) -> bool {
        true
    }

    fn spend(&mut self, _ops: u64) {}
}
