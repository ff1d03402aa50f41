//! Producer side: turns sensor readings into snapshots and fans them out.

use crate::config::SafeRangeConfig;
use crate::snapshot::{GlucoseUnit, Snapshot, Trend};
use crate::transport::dispatcher::{DispatchOutcome, TransportDispatcher};
use crate::transport::traits::ChannelReachability;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// A raw reading as the producer observes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub unit: GlucoseUnit,
    pub trend: Trend,
    pub insulin_on_board: Option<f64>,
    pub carbs_on_board: Option<f64>,
    pub reading_time: DateTime<Utc>,
    pub control_loop_time: Option<DateTime<Utc>>,
}

impl Reading {
    /// Reading with only the required fields set.
    #[must_use]
    pub fn new(value: f64, reading_time: DateTime<Utc>) -> Self {
        Self {
            value,
            unit: GlucoseUnit::default(),
            trend: Trend::default(),
            insulin_on_board: None,
            carbs_on_board: None,
            reading_time,
            control_loop_time: None,
        }
    }
}

/// Builds snapshots from successive readings and hands them to the dispatcher.
pub struct SnapshotProducer {
    dispatcher: TransportDispatcher,
    safe_range: SafeRangeConfig,
    last: Option<Snapshot>,
}

impl SnapshotProducer {
    #[must_use]
    pub fn new(dispatcher: TransportDispatcher, safe_range: SafeRangeConfig) -> Self {
        Self {
            dispatcher,
            safe_range,
            last: None,
        }
    }

    /// Last snapshot handed to the dispatcher.
    pub fn last(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }

    /// Build the snapshot for `reading` without dispatching it.
    #[must_use]
    pub fn snapshot_for(&self, reading: &Reading) -> Snapshot {
        let delta = self
            .last
            .as_ref()
            .map_or(0.0, |previous| reading.value - previous.value());
        Snapshot::builder(reading.value, reading.reading_time)
            .unit(reading.unit)
            .trend(reading.trend)
            .delta(delta)
            .insulin_on_board(reading.insulin_on_board)
            .carbs_on_board(reading.carbs_on_board)
            .control_loop_time(reading.control_loop_time)
            .urgent(self.safe_range.is_urgent(reading.value, reading.unit))
            .build()
    }

    /// Publish `reading`. Returns `None` when it is not newer than the last
    /// published reading or carries a non-finite number.
    pub async fn observe(
        &mut self,
        reading: Reading,
        reachability: ChannelReachability,
    ) -> Option<DispatchOutcome> {
        if let Some(last) = &self.last
            && reading.reading_time <= last.reading_time()
        {
            debug!(
                reading_time = %reading.reading_time,
                "reading not newer than last published, skipping"
            );
            return None;
        }

        let snapshot = self.snapshot_for(&reading);
        if let Err(e) = snapshot.ensure_finite() {
            warn!(reading_time = %reading.reading_time, "refusing reading: {e}");
            return None;
        }
        let outcome = self.dispatcher.dispatch(&snapshot, reachability).await;
        info!(
            value = %snapshot.display_value(),
            urgent = snapshot.urgent(),
            delivered = outcome.delivered_any(),
            "snapshot published"
        );
        self.last = Some(snapshot);
        Some(outcome)
    }
}
