//! The synchronized unit of state: one glucose observation plus derived fields.
//!
//! A [`Snapshot`] is immutable once built. Its `reading_time` is the only
//! ordering key; every other field is opaque payload as far as merging is
//! concerned.

use crate::error::{Result, SyncError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wire payload version.
pub const PAYLOAD_VERSION: u8 = 1;

/// mg/dL per mmol/L of glucose.
pub const MG_PER_DL_PER_MMOL_PER_L: f64 = 18.0182;

/// Direction and rate of change reported with a reading.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trend {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    #[default]
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    NotComputable,
}

impl Trend {
    /// Arrow symbol used by compact displays.
    #[must_use]
    pub fn arrow(self) -> &'static str {
        match self {
            Self::DoubleUp => "⇈",
            Self::SingleUp => "↑",
            Self::FortyFiveUp => "↗",
            Self::Flat => "→",
            Self::FortyFiveDown => "↘",
            Self::SingleDown => "↓",
            Self::DoubleDown => "⇊",
            Self::NotComputable => "?",
        }
    }
}

/// Unit the observed value is expressed in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GlucoseUnit {
    #[default]
    MgPerDl,
    MmolPerL,
}

impl GlucoseUnit {
    /// Express `value`, given in this unit, in mg/dL.
    #[must_use]
    pub fn to_mg_per_dl(self, value: f64) -> f64 {
        match self {
            Self::MgPerDl => value,
            Self::MmolPerL => value * MG_PER_DL_PER_MMOL_PER_L,
        }
    }

    /// Format `value` with the precision conventional for this unit.
    #[must_use]
    pub fn format(self, value: f64) -> String {
        match self {
            Self::MgPerDl => format!("{value:.0}"),
            Self::MmolPerL => format!("{value:.1}"),
        }
    }

    /// Format a signed change since the previous reading.
    #[must_use]
    pub fn format_delta(self, delta: f64) -> String {
        let magnitude = self.format(delta.abs());
        if delta < 0.0 {
            format!("-{magnitude}")
        } else {
            format!("+{magnitude}")
        }
    }
}

/// One immutable observed-reading record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    value: f64,
    #[serde(default)]
    unit: GlucoseUnit,
    trend: Trend,
    delta: f64,
    #[serde(default)]
    insulin_on_board: Option<f64>,
    #[serde(default)]
    carbs_on_board: Option<f64>,
    reading_time: DateTime<Utc>,
    #[serde(default)]
    control_loop_time: Option<DateTime<Utc>>,
    /// Older producers never sent this field.
    #[serde(default)]
    urgent: bool,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u8,
    #[serde(flatten)]
    snapshot: &'a Snapshot,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default = "legacy_payload_version")]
    #[allow(dead_code)]
    version: u8,
    #[serde(flatten)]
    snapshot: Snapshot,
}

fn legacy_payload_version() -> u8 {
    0
}

impl Snapshot {
    /// Start building a snapshot for a value observed at `reading_time`.
    #[must_use]
    pub fn builder(value: f64, reading_time: DateTime<Utc>) -> SnapshotBuilder {
        SnapshotBuilder {
            snapshot: Snapshot {
                value,
                unit: GlucoseUnit::default(),
                trend: Trend::default(),
                delta: 0.0,
                insulin_on_board: None,
                carbs_on_board: None,
                reading_time,
                control_loop_time: None,
                urgent: false,
            },
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> GlucoseUnit {
        self.unit
    }

    pub fn trend(&self) -> Trend {
        self.trend
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn insulin_on_board(&self) -> Option<f64> {
        self.insulin_on_board
    }

    pub fn carbs_on_board(&self) -> Option<f64> {
        self.carbs_on_board
    }

    /// Authoritative clock for staleness and the sole ordering key.
    pub fn reading_time(&self) -> DateTime<Utc> {
        self.reading_time
    }

    /// Last automated-control cycle, if the producer runs one.
    pub fn control_loop_time(&self) -> Option<DateTime<Utc>> {
        self.control_loop_time
    }

    /// `true` when the value was outside the configured safe range.
    pub fn urgent(&self) -> bool {
        self.urgent
    }

    /// Value formatted for display, e.g. `"124"` or `"6.9"`.
    #[must_use]
    pub fn display_value(&self) -> String {
        self.unit.format(self.value)
    }

    /// Returns `true` when this snapshot's reading is strictly later than `other`'s.
    #[must_use]
    pub fn is_newer_than(&self, other: &Snapshot) -> bool {
        self.reading_time > other.reading_time
    }

    /// Check that every numeric field is finite.
    ///
    /// JSON has no representation for NaN or infinity, so such a snapshot
    /// would otherwise go out with `null` fields that no consumer accepts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encode`] naming the first non-finite field.
    pub fn ensure_finite(&self) -> Result<()> {
        let fields = [
            ("value", Some(self.value)),
            ("delta", Some(self.delta)),
            ("insulinOnBoard", self.insulin_on_board),
            ("carbsOnBoard", self.carbs_on_board),
        ];
        for (name, field) in fields {
            if let Some(v) = field
                && !v.is_finite()
            {
                return Err(SyncError::Encode(format!("{name} is not finite ({v})")));
            }
        }
        Ok(())
    }

    /// Encode into the wire payload shared by every delivery channel.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encode`] if a numeric field is not finite or
    /// serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        self.ensure_finite()?;
        let envelope = EnvelopeRef {
            version: PAYLOAD_VERSION,
            snapshot: self,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| SyncError::Encode(format!("cannot encode snapshot: {e}")))
    }

    /// Decode a wire payload.
    ///
    /// A payload without the `urgent` field decodes with `urgent = false`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decode`] for malformed JSON or a missing required
    /// field (`value`, `trend`, `delta`, `readingTime`).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| SyncError::Decode(format!("cannot decode snapshot: {e}")))?;
        if !envelope.snapshot.value.is_finite() || !envelope.snapshot.delta.is_finite() {
            return Err(SyncError::Decode("non-finite value or delta".to_owned()));
        }
        Ok(envelope.snapshot)
    }
}

/// Builder for [`Snapshot`]; the only way to set optional fields.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    snapshot: Snapshot,
}

impl SnapshotBuilder {
    pub fn unit(mut self, unit: GlucoseUnit) -> Self {
        self.snapshot.unit = unit;
        self
    }

    pub fn trend(mut self, trend: Trend) -> Self {
        self.snapshot.trend = trend;
        self
    }

    pub fn delta(mut self, delta: f64) -> Self {
        self.snapshot.delta = delta;
        self
    }

    pub fn insulin_on_board(mut self, units: Option<f64>) -> Self {
        self.snapshot.insulin_on_board = units;
        self
    }

    pub fn carbs_on_board(mut self, grams: Option<f64>) -> Self {
        self.snapshot.carbs_on_board = grams;
        self
    }

    pub fn control_loop_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.snapshot.control_loop_time = at;
        self
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.snapshot.urgent = urgent;
        self
    }

    #[must_use]
    pub fn build(self) -> Snapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ordering_uses_reading_time_only() {
        let older = Snapshot::builder(250.0, at(0)).urgent(true).build();
        let newer = Snapshot::builder(100.0, at(60)).build();
        let same_time = Snapshot::builder(300.0, at(60)).delta(40.0).build();

        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(!same_time.is_newer_than(&newer));
        assert!(!newer.is_newer_than(&same_time));
    }

    #[test]
    fn encoded_payload_decodes_to_equal_snapshot() {
        let snapshot = Snapshot::builder(6.9, at(0))
            .unit(GlucoseUnit::MmolPerL)
            .trend(Trend::FortyFiveDown)
            .delta(-0.3)
            .insulin_on_board(Some(1.25))
            .carbs_on_board(Some(18.0))
            .control_loop_time(Some(at(-120)))
            .urgent(true)
            .build();

        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn payload_without_urgent_field_decodes_as_not_urgent() {
        let payload = br#"{
            "value": 142.0,
            "trend": "singleUp",
            "delta": 4.0,
            "readingTime": "2024-03-01T12:00:00Z"
        }"#;
        let snapshot = Snapshot::decode(payload).expect("legacy payload decodes");
        assert!(!snapshot.urgent());
        assert_eq!(snapshot.trend(), Trend::SingleUp);
        assert_eq!(snapshot.unit(), GlucoseUnit::MgPerDl);
        assert!(snapshot.insulin_on_board().is_none());
    }

    #[test]
    fn payload_missing_reading_time_is_rejected() {
        let payload = br#"{"value": 142.0, "trend": "flat", "delta": 0.0}"#;
        let err = Snapshot::decode(payload).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(err.to_string().contains("readingTime"), "got: {err}");
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert!(matches!(
            Snapshot::decode(b"\x00\x01not json"),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn unknown_trend_is_a_decode_error() {
        let payload = br#"{
            "value": 100.0, "trend": "sideways", "delta": 0.0,
            "readingTime": "2024-03-01T12:00:00Z"
        }"#;
        assert!(Snapshot::decode(payload).is_err());
    }

    #[test]
    fn non_finite_fields_are_not_encoded() {
        let cases = [
            Snapshot::builder(f64::NAN, at(0)).build(),
            Snapshot::builder(120.0, at(0)).delta(f64::INFINITY).build(),
            Snapshot::builder(120.0, at(0))
                .insulin_on_board(Some(f64::NAN))
                .build(),
            Snapshot::builder(120.0, at(0))
                .carbs_on_board(Some(f64::NEG_INFINITY))
                .build(),
        ];
        for snapshot in cases {
            let err = snapshot.encode().unwrap_err();
            assert!(matches!(err, SyncError::Encode(_)), "got: {err}");
        }
        let finite = Snapshot::builder(120.0, at(0))
            .insulin_on_board(Some(0.0))
            .build();
        assert!(finite.encode().is_ok());
    }

    #[test]
    fn mmol_converts_to_mg_per_dl() {
        assert_eq!(GlucoseUnit::MgPerDl.to_mg_per_dl(120.0), 120.0);
        let converted = GlucoseUnit::MmolPerL.to_mg_per_dl(5.0);
        assert!((converted - 90.091).abs() < 1e-9, "got {converted}");
    }

    #[test]
    fn encoded_payload_carries_version() {
        let snapshot = Snapshot::builder(120.0, at(0)).build();
        let raw: serde_json::Value = serde_json::from_slice(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(raw["version"], u64::from(PAYLOAD_VERSION));
        assert_eq!(raw["urgent"], false);
    }

    #[test]
    fn display_formatting_follows_unit() {
        let mgdl = Snapshot::builder(123.6, at(0)).delta(-4.2).build();
        assert_eq!(mgdl.display_value(), "124");
        assert_eq!(mgdl.unit().format_delta(mgdl.delta()), "-4");

        let mmol = Snapshot::builder(6.84, at(0))
            .unit(GlucoseUnit::MmolPerL)
            .delta(0.31)
            .build();
        assert_eq!(mmol.display_value(), "6.8");
        assert_eq!(mmol.unit().format_delta(mmol.delta()), "+0.3");
    }

    #[test]
    fn builder_does_not_share_state_between_snapshots() {
        let base = Snapshot::builder(100.0, at(0));
        let a = base.clone().urgent(true).build();
        let b = base.delta(3.0).build();
        assert!(a.urgent());
        assert!(!b.urgent());
        assert_eq!(a.reading_time(), b.reading_time());
    }

    #[test]
    fn trend_arrows_are_distinct() {
        let trends = [
            Trend::DoubleUp,
            Trend::SingleUp,
            Trend::FortyFiveUp,
            Trend::Flat,
            Trend::FortyFiveDown,
            Trend::SingleDown,
            Trend::DoubleDown,
            Trend::NotComputable,
        ];
        let mut arrows: Vec<&str> = trends.iter().map(|t| t.arrow()).collect();
        arrows.sort_unstable();
        arrows.dedup();
        assert_eq!(arrows.len(), trends.len());
    }
}
