//! Configuration types for the sync engine.

use crate::error::{Result, SyncError};
use crate::snapshot::GlucoseUnit;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for producer and consumer sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Staleness classification thresholds.
    pub freshness: FreshnessConfig,
    /// Refresh cadence and horizon for urgent and normal readings.
    pub cadence: CadenceConfig,
    /// Safe glucose range; readings outside it are urgent.
    pub safe_range: SafeRangeConfig,
    /// Background wake budget and denial backoff.
    pub wake: WakeConfig,
    /// In-process transport queue sizes.
    pub transport: TransportConfig,
    /// Shared store location.
    pub store: StoreConfig,
}

/// Freshness tier thresholds, in minutes of reading age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Readings older than this are at least `Stale`.
    pub stale_after_mins: u32,
    /// Readings older than this are `VeryStale`.
    pub very_stale_after_mins: u32,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            stale_after_mins: 10,
            very_stale_after_mins: 15,
        }
    }
}

/// Refresh plan cadence and horizon, in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Step between refreshes while the latest reading is urgent.
    pub urgent_cadence_mins: u32,
    /// Plan length while the latest reading is urgent.
    pub urgent_horizon_mins: u32,
    /// Step between refreshes for in-range readings or no reading.
    pub normal_cadence_mins: u32,
    /// Plan length for in-range readings or no reading.
    pub normal_horizon_mins: u32,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            urgent_cadence_mins: 5,
            urgent_horizon_mins: 30,
            normal_cadence_mins: 15,
            normal_horizon_mins: 60,
        }
    }
}

/// Inclusive safe range for observed values.
///
/// Bounds are in mg/dL; values in other units are converted before comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeRangeConfig {
    /// Lowest value still considered in range.
    pub low: f64,
    /// Highest value still considered in range.
    pub high: f64,
}

impl Default for SafeRangeConfig {
    fn default() -> Self {
        Self {
            low: 70.0,
            high: 180.0,
        }
    }
}

impl SafeRangeConfig {
    /// Returns `true` when `value`, expressed in `unit`, lies outside `[low, high]`.
    #[must_use]
    pub fn is_urgent(&self, value: f64, unit: GlucoseUnit) -> bool {
        let mg_per_dl = unit.to_mg_per_dl(value);
        mg_per_dl < self.low || mg_per_dl > self.high
    }
}

/// Largest accepted backoff or jitter setting: one day.
pub const MAX_WAKE_DELAY_SECS: u64 = 86_400;

/// Background wake budget.
///
/// The OS caps low-frequency background wakes per hour. The scheduler treats
/// the cap as hard and backs off when a request is denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Maximum wakes the facility grants in any one-hour window.
    pub max_wakes_per_hour: u32,
    /// First retry delay after a denied request.
    pub denied_backoff_base_secs: u64,
    /// Upper bound on the retry delay.
    pub denied_backoff_max_secs: u64,
    /// Random jitter added to each retry delay.
    pub jitter_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            max_wakes_per_hour: 4,
            denied_backoff_base_secs: 60,
            denied_backoff_max_secs: 900,
            jitter_secs: 5,
        }
    }
}

/// In-process transport sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bounded capacity of the consumer inbox.
    pub inbox_capacity: usize,
    /// Capacity reserved for immediate-channel messages.
    pub immediate_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 32,
            immediate_capacity: 8,
        }
    }
}

/// Shared store location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one file per key (None = platform data dir).
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolved store directory.
    #[must_use]
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("glance-sync").join("store"))
            .unwrap_or_else(|| PathBuf::from("/tmp/glance-sync-store"))
    }
}

fn minutes(mins: u32) -> TimeDelta {
    TimeDelta::minutes(i64::from(mins))
}

impl FreshnessConfig {
    /// Age beyond which a reading is stale.
    #[must_use]
    pub fn stale_after(&self) -> TimeDelta {
        minutes(self.stale_after_mins)
    }

    /// Age beyond which a reading is very stale.
    #[must_use]
    pub fn very_stale_after(&self) -> TimeDelta {
        minutes(self.very_stale_after_mins)
    }
}

impl CadenceConfig {
    /// Cadence and horizon for urgent readings.
    #[must_use]
    pub fn urgent(&self) -> (TimeDelta, TimeDelta) {
        (
            minutes(self.urgent_cadence_mins),
            minutes(self.urgent_horizon_mins),
        )
    }

    /// Cadence and horizon for in-range readings.
    #[must_use]
    pub fn normal(&self) -> (TimeDelta, TimeDelta) {
        (
            minutes(self.normal_cadence_mins),
            minutes(self.normal_horizon_mins),
        )
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/glance-sync/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("glance-sync").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("/tmp/glance-sync-config/config.toml"))
    }

    /// Reject combinations that would stall planning or invert tiers.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let f = &self.freshness;
        if f.very_stale_after_mins < f.stale_after_mins {
            return Err(SyncError::Config(format!(
                "very_stale_after_mins ({}) must be >= stale_after_mins ({})",
                f.very_stale_after_mins, f.stale_after_mins
            )));
        }

        let c = &self.cadence;
        for (name, cadence, horizon) in [
            ("urgent", c.urgent_cadence_mins, c.urgent_horizon_mins),
            ("normal", c.normal_cadence_mins, c.normal_horizon_mins),
        ] {
            if cadence == 0 {
                return Err(SyncError::Config(format!("{name} cadence must be > 0")));
            }
            if horizon < cadence {
                return Err(SyncError::Config(format!(
                    "{name} horizon ({horizon}m) must be >= cadence ({cadence}m)"
                )));
            }
        }

        if self.safe_range.low >= self.safe_range.high {
            return Err(SyncError::Config(format!(
                "safe range low ({}) must be below high ({})",
                self.safe_range.low, self.safe_range.high
            )));
        }

        if self.wake.max_wakes_per_hour == 0 {
            return Err(SyncError::Config(
                "max_wakes_per_hour must be > 0".to_owned(),
            ));
        }
        if self.wake.denied_backoff_max_secs < self.wake.denied_backoff_base_secs {
            return Err(SyncError::Config(
                "denied_backoff_max_secs must be >= denied_backoff_base_secs".to_owned(),
            ));
        }
        for (name, secs) in [
            ("denied_backoff_base_secs", self.wake.denied_backoff_base_secs),
            ("denied_backoff_max_secs", self.wake.denied_backoff_max_secs),
            ("jitter_secs", self.wake.jitter_secs),
        ] {
            if secs > MAX_WAKE_DELAY_SECS {
                return Err(SyncError::Config(format!(
                    "{name} ({secs}) must be <= {MAX_WAKE_DELAY_SECS}"
                )));
            }
        }

        if self.transport.inbox_capacity == 0 || self.transport.immediate_capacity == 0 {
            return Err(SyncError::Config(
                "transport capacities must be > 0".to_owned(),
            ));
        }

        Ok(())
    }
}
