//! Staleness classifier.
//!
//! Maps the age of the latest reading to a coarse [`FreshnessTier`]. Pure and
//! deterministic; callers may invoke it at any rate.

use crate::config::FreshnessConfig;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Coarse classification of how old the latest reading is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessTier {
    /// Reading age is within the stale threshold.
    Fresh,
    /// Reading age is past the stale threshold but within the very-stale one.
    Stale,
    /// Reading age is past the very-stale threshold.
    VeryStale,
    /// No reading has ever been merged (or the store could not be read).
    Unknown,
}

impl FreshnessTier {
    /// Short label for logs and status output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::VeryStale => "very stale",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FreshnessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Age thresholds separating the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    /// Ages strictly above this are at least `Stale`.
    pub stale_after: TimeDelta,
    /// Ages strictly above this are `VeryStale`.
    pub very_stale_after: TimeDelta,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self::from(&FreshnessConfig::default())
    }
}

impl From<&FreshnessConfig> for FreshnessThresholds {
    fn from(config: &FreshnessConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            very_stale_after: config.very_stale_after(),
        }
    }
}

/// Classify a reading taken at `reading_time` as seen at `now`.
///
/// Readings stamped in the future (producer clock ahead) count as `Fresh`.
#[must_use]
pub fn classify(
    now: DateTime<Utc>,
    reading_time: Option<DateTime<Utc>>,
    thresholds: &FreshnessThresholds,
) -> FreshnessTier {
    let Some(reading_time) = reading_time else {
        return FreshnessTier::Unknown;
    };

    let age = now.signed_duration_since(reading_time);
    if age <= thresholds.stale_after {
        FreshnessTier::Fresh
    } else if age <= thresholds.very_stale_after {
        FreshnessTier::Stale
    } else {
        FreshnessTier::VeryStale
    }
}

/// Whole minutes elapsed since `reading_time`, clamped at zero.
#[must_use]
pub fn age_minutes(now: DateTime<Utc>, reading_time: DateTime<Utc>) -> i64 {
    now.signed_duration_since(reading_time).num_minutes().max(0)
}
