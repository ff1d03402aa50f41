//! Timeline planner.
//!
//! Computes the instants at which the consumer's displayed freshness should be
//! re-evaluated. Cadence and horizon adapt to urgency: an out-of-range reading
//! is re-checked more often over a shorter lease. A plan is a renewable lease;
//! once its last instant passes the consumer must plan again.

use crate::config::{CadenceConfig, SyncConfig};
use crate::freshness::{FreshnessThresholds, FreshnessTier, classify};
use crate::snapshot::Snapshot;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

/// What the consumer does when the last planned instant is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Compute a fresh plan straight away.
    Replan,
    /// Wait for an external trigger (new data, user activation).
    AwaitTrigger,
}

/// One planned re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub at: DateTime<Utc>,
    /// Tier the display should show from `at` until the next entry.
    pub tier: FreshnessTier,
}

/// Ordered future refresh instants plus the lease they form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPlan {
    entries: Vec<PlanEntry>,
    cadence: TimeDelta,
    horizon: TimeDelta,
    expiry: ExpiryPolicy,
    urgent: bool,
}

impl RefreshPlan {
    /// Entries in strictly increasing time order; the first is the plan's `now`.
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Planned instants without tiers.
    pub fn instants(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.entries.iter().map(|entry| entry.at)
    }

    pub fn cadence(&self) -> TimeDelta {
        self.cadence
    }

    pub fn horizon(&self) -> TimeDelta {
        self.horizon
    }

    pub fn expiry(&self) -> ExpiryPolicy {
        self.expiry
    }

    /// `true` when the urgent cadence was used.
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Instant the plan was computed for.
    pub fn planned_at(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|entry| entry.at)
    }

    /// Last planned instant.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.at)
    }

    /// Returns `true` once `now` has reached the last planned instant.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_none_or(|last| now >= last)
    }

    /// First planned instant strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.instants().find(|at| *at > now)
    }

    /// Tier in effect at `instant`, i.e. that of the latest entry at or before it.
    #[must_use]
    pub fn tier_at(&self, instant: DateTime<Utc>) -> FreshnessTier {
        self.entries
            .iter()
            .take_while(|entry| entry.at <= instant)
            .last()
            .map_or(FreshnessTier::Unknown, |entry| entry.tier)
    }
}

/// Builds [`RefreshPlan`]s from the latest snapshot.
#[derive(Debug, Clone)]
pub struct TimelinePlanner {
    thresholds: FreshnessThresholds,
    cadence: CadenceConfig,
}

impl Default for TimelinePlanner {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

impl TimelinePlanner {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            thresholds: FreshnessThresholds::from(&config.freshness),
            cadence: config.cadence.clone(),
        }
    }

    pub fn thresholds(&self) -> &FreshnessThresholds {
        &self.thresholds
    }

    /// Plan refreshes from `now` given the latest merged snapshot, if any.
    #[must_use]
    pub fn plan(&self, now: DateTime<Utc>, snapshot: Option<&Snapshot>) -> RefreshPlan {
        let urgent = snapshot.is_some_and(Snapshot::urgent);
        let (mut cadence, horizon) = if urgent {
            self.cadence.urgent()
        } else {
            self.cadence.normal()
        };
        if cadence <= TimeDelta::zero() {
            warn!("non-positive refresh cadence configured, using one minute");
            cadence = TimeDelta::minutes(1);
        }

        let reading_time = snapshot.map(Snapshot::reading_time);
        let end = now + horizon;
        let mut entries = Vec::new();
        let mut at = now;
        while at <= end {
            entries.push(PlanEntry {
                at,
                tier: classify(at, reading_time, &self.thresholds),
            });
            at += cadence;
        }
        // Horizon shorter than cadence still yields the current entry.
        if entries.is_empty() {
            entries.push(PlanEntry {
                at: now,
                tier: classify(now, reading_time, &self.thresholds),
            });
        }

        RefreshPlan {
            entries,
            cadence,
            horizon,
            expiry: ExpiryPolicy::Replan,
            urgent,
        }
    }
}
