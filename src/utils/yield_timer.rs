//! Cooperative yield budget.
//!
//! One connection draining already-buffered input runs synchronously on the
//! reactor. The budget bounds that run by wall-clock time and by iteration
//! count so a busy peer cannot starve the others; both limits are
//! configurable.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct YieldTimer {
    started: Instant,
    budget: Duration,
    max_iterations: usize,
    iterations: usize,
}

impl YieldTimer {
    pub fn new(budget: Duration, max_iterations: usize) -> Self {
        Self {
            started: Instant::now(),
            budget,
            max_iterations,
            iterations: 0,
        }
    }

    /// Whether the caller may run one more iteration. Counts the iteration.
    pub fn should_keep_going(&mut self) -> bool {
        if self.iterations >= self.max_iterations {
            return false;
        }
        // the first iteration always runs so every cycle makes progress
        if self.iterations > 0 && self.started.elapsed() >= self.budget {
            return false;
        }
        self.iterations += 1;
        true
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}
