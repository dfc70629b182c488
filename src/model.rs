//! Canonical shot record and result classification.
//!
//! Every inbound wire message, regardless of transport or encoding, is
//! normalized into a [`ShotRecord`]. Records are immutable once stored:
//! each update builds a new value, so concurrent readers never observe a
//! torn update.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Serialize, Serializer};

/// Result classification carried on every record.
///
/// Numeric wire codes 0-9 map onto the named variants. Unrecognized codes
/// decode to [`Other`](ResultKind::Other) (displayed as `"Type {code}"`)
/// rather than failing the message. Non-integer wire labels are carried
/// verbatim in [`Text`](ResultKind::Text), except that labels matching a
/// known variant's display string fold back onto that variant so a textual
/// `"Error"` still classifies as a status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKind {
    Unknown,
    Initializing,
    WaitingForBall,
    WaitingForSimulator,
    PausingForStabilization,
    MultipleBalls,
    BallReady,
    Hit,
    Error,
    Calibration,
    /// Unrecognized numeric code from the wire.
    Other(i64),
    /// Free-text label passed through from a map-format message.
    Text(String),
}

impl ResultKind {
    /// Map a numeric wire code onto the fixed enumeration.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ResultKind::Unknown,
            1 => ResultKind::Initializing,
            2 => ResultKind::WaitingForBall,
            3 => ResultKind::WaitingForSimulator,
            4 => ResultKind::PausingForStabilization,
            5 => ResultKind::MultipleBalls,
            6 => ResultKind::BallReady,
            7 => ResultKind::Hit,
            8 => ResultKind::Error,
            9 => ResultKind::Calibration,
            other => ResultKind::Other(other),
        }
    }

    /// Map a textual label onto the enumeration, falling back to `Text`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Unknown" => ResultKind::Unknown,
            "Initializing" => ResultKind::Initializing,
            "Waiting For Ball" => ResultKind::WaitingForBall,
            "Waiting For Simulator" => ResultKind::WaitingForSimulator,
            "Pausing For Stabilization" => ResultKind::PausingForStabilization,
            "Multiple Balls" => ResultKind::MultipleBalls,
            "Ball Ready" => ResultKind::BallReady,
            "Hit" => ResultKind::Hit,
            "Error" => ResultKind::Error,
            "Calibration" => ResultKind::Calibration,
            other => ResultKind::Text(other.to_owned()),
        }
    }

    /// Status classifications update only classification, message, and
    /// timestamp; prior physical measurements are preserved. Anything else
    /// (including `Hit`, unknown codes, and free text) replaces the whole
    /// record.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            ResultKind::BallReady
                | ResultKind::Initializing
                | ResultKind::WaitingForBall
                | ResultKind::WaitingForSimulator
                | ResultKind::PausingForStabilization
                | ResultKind::MultipleBalls
                | ResultKind::Error
                | ResultKind::Calibration
        )
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Unknown => f.write_str("Unknown"),
            ResultKind::Initializing => f.write_str("Initializing"),
            ResultKind::WaitingForBall => f.write_str("Waiting For Ball"),
            ResultKind::WaitingForSimulator => f.write_str("Waiting For Simulator"),
            ResultKind::PausingForStabilization => f.write_str("Pausing For Stabilization"),
            ResultKind::MultipleBalls => f.write_str("Multiple Balls"),
            ResultKind::BallReady => f.write_str("Ball Ready"),
            ResultKind::Hit => f.write_str("Hit"),
            ResultKind::Error => f.write_str("Error"),
            ResultKind::Calibration => f.write_str("Calibration"),
            ResultKind::Other(code) => write!(f, "Type {code}"),
            ResultKind::Text(label) => f.write_str(label),
        }
    }
}

impl Serialize for ResultKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The canonical, unit-consistent representation of one ball-flight or
/// status event. Speed is always mph regardless of the wire unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotRecord {
    /// Carry distance (m)
    pub carry: f64,
    /// Ball speed (mph)
    pub speed: f64,
    /// Launch angle (deg)
    pub launch_angle: f64,
    /// Side angle (deg, neg = left)
    pub side_angle: f64,
    /// Backspin (RPM)
    pub back_spin: i32,
    /// Sidespin (RPM)
    pub side_spin: i32,
    #[serde(rename = "result_type")]
    pub result: ResultKind,
    pub message: String,
    /// ISO-8601, refreshed on every decode.
    pub timestamp: String,
    /// Associated image file references, in wire order.
    pub images: Vec<String>,
    /// Which sensor emitted this record, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_source: Option<String>,
}

impl ShotRecord {
    /// The initial record: zero physical fields, waiting for a ball.
    pub fn initial() -> Self {
        Self {
            carry: 0.0,
            speed: 0.0,
            launch_angle: 0.0,
            side_angle: 0.0,
            back_spin: 0,
            side_spin: 0,
            result: ResultKind::WaitingForBall,
            message: String::new(),
            timestamp: now_iso8601(),
            images: Vec::new(),
            camera_source: None,
        }
    }

    /// Build the status-merged successor of `self`: classification, message,
    /// and timestamp from `update`, everything else retained.
    pub fn with_status(&self, update: &ShotRecord) -> Self {
        Self {
            result: update.result.clone(),
            message: update.message.clone(),
            timestamp: update.timestamp.clone(),
            ..self.clone()
        }
    }
}

impl Default for ShotRecord {
    fn default() -> Self {
        Self::initial()
    }
}

/// Current wall-clock time as an ISO-8601 string.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping() {
        assert_eq!(ResultKind::from_code(7), ResultKind::Hit);
        assert_eq!(ResultKind::from_code(2), ResultKind::WaitingForBall);
        assert_eq!(ResultKind::from_code(42), ResultKind::Other(42));
        assert_eq!(ResultKind::from_code(42).to_string(), "Type 42");
    }

    #[test]
    fn label_round_trip() {
        for code in 0..10 {
            let kind = ResultKind::from_code(code);
            assert_eq!(ResultKind::from_label(&kind.to_string()), kind);
        }
        assert_eq!(
            ResultKind::from_label("fancy"),
            ResultKind::Text("fancy".into())
        );
    }

    #[test]
    fn status_subset() {
        assert!(ResultKind::Error.is_status());
        assert!(ResultKind::BallReady.is_status());
        assert!(ResultKind::Calibration.is_status());
        assert!(!ResultKind::Hit.is_status());
        assert!(!ResultKind::Unknown.is_status());
        assert!(!ResultKind::Other(12).is_status());
    }

    #[test]
    fn textual_error_is_status() {
        // A map-format message can carry "Error" as a string; it must still
        // take the status-merge path.
        assert!(ResultKind::from_label("Error").is_status());
    }

    #[test]
    fn status_merge_preserves_measurements() {
        let prior = ShotRecord {
            carry: 250.0,
            speed: 150.0,
            launch_angle: 14.0,
            back_spin: 2800,
            result: ResultKind::Hit,
            ..ShotRecord::initial()
        };
        let update = ShotRecord {
            result: ResultKind::Error,
            message: "camera fault".into(),
            ..ShotRecord::initial()
        };
        let merged = prior.with_status(&update);
        assert_eq!(merged.carry, 250.0);
        assert_eq!(merged.speed, 150.0);
        assert_eq!(merged.launch_angle, 14.0);
        assert_eq!(merged.back_spin, 2800);
        assert_eq!(merged.result, ResultKind::Error);
        assert_eq!(merged.message, "camera fault");
    }

    #[test]
    fn serializes_result_as_display_string() {
        let record = ShotRecord::initial();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["result_type"], "Waiting For Ball");
        assert!(json.get("camera_source").is_none());
    }
}
