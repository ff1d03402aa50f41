//! Background wake budget.
//!
//! The OS grants only a handful of low-frequency background wakes per hour.
//! [`WakeBudget`] models that cap as a sliding one-hour window of granted
//! wake timestamps.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use thiserror::Error;

/// Budget error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    /// No wakes left in the current window.
    #[error("wake budget exhausted; retry after {retry_after_secs}s")]
    Exhausted {
        /// Seconds until the oldest granted wake leaves the window.
        retry_after_secs: u64,
    },
}

/// Sliding-window wake limiter.
#[derive(Debug, Clone)]
pub struct WakeBudget {
    /// Maximum wakes in any one-hour window.
    max_per_hour: u32,
    /// Timestamps of granted wakes inside the window.
    window: VecDeque<DateTime<Utc>>,
}

fn window_len() -> TimeDelta {
    TimeDelta::hours(1)
}

impl WakeBudget {
    #[must_use]
    pub fn new(max_per_hour: u32) -> Self {
        Self {
            max_per_hour,
            window: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window_start = now - window_len();
        while let Some(&first) = self.window.front() {
            if first <= window_start {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check whether a wake at `now` would be granted, without recording it.
    pub fn check_at(&mut self, now: DateTime<Utc>) -> Result<(), BudgetError> {
        self.prune(now);
        if self.window.len() < self.max_per_hour as usize {
            return Ok(());
        }
        let retry_after_secs = self.window.front().map_or(0, |&oldest| {
            let remaining = window_len() - now.signed_duration_since(oldest);
            u64::try_from(remaining.num_seconds()).unwrap_or(0).saturating_add(1)
        });
        Err(BudgetError::Exhausted { retry_after_secs })
    }

    /// Record a wake at `now` if the budget allows it.
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> Result<(), BudgetError> {
        self.check_at(now)?;
        self.window.push_back(now);
        Ok(())
    }

    /// Wakes still available in the window ending at `now`.
    #[must_use]
    pub fn remaining_at(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.max_per_hour
            .saturating_sub(u32::try_from(self.window.len()).unwrap_or(u32::MAX))
    }
}
