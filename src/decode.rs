//! Wire decoding: msgpack payloads → canonical shot records.
//!
//! Both transports carry schema-less msgpack. Payload shape is resolved
//! exactly once, at this boundary, into a [`WirePayload`] tagged variant;
//! downstream code only ever sees [`ShotRecord`]s.
//!
//! Pure functions throughout — no I/O, no shared state.

use rmpv::Value;
use tracing::warn;

use crate::error::{DecodeError, Result};
use crate::model::{now_iso8601, ResultKind, ShotRecord};

/// Meters-per-second → miles-per-hour.
pub const MPS_TO_MPH: f64 = 2.237;

/// Minimum element count for an array-format message. Index 11 (the image
/// path list) is optional.
pub const MIN_ARRAY_FIELDS: usize = 11;

/// A decoded wire payload, resolved to its shape.
#[derive(Debug, Clone)]
pub enum WirePayload {
    /// Positional fields, indexed per [`decode_array`].
    Array(Vec<Value>),
    /// Sparse named fields, keyed per [`decode_map`].
    Map(Vec<(Value, Value)>),
}

impl WirePayload {
    /// Resolve a decoded msgpack value into its payload shape.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(WirePayload::Array(items)),
            Value::Map(entries) => Ok(WirePayload::Map(entries)),
            _ => Err(DecodeError::NotShotShaped),
        }
    }
}

/// Read one msgpack value from `data`, rejecting trailing bytes.
///
/// Trailing bytes mean the payload was not a single serialized object
/// (in practice: a raw image frame that slipped past the size filter).
pub fn unpack(data: &[u8]) -> Result<Value> {
    let mut cursor = data;
    let value = rmpv::decode::read_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(DecodeError::ExtraData { extra: cursor.len() });
    }
    Ok(value)
}

/// Decode an array-format message.
///
/// Index mapping: [0] carry (m), [1] speed (m/s, converted to mph),
/// [2] launch angle (deg), [3] side angle (deg), [4] backspin (RPM),
/// [5] sidespin (RPM), [6] confidence (unused), [7] club type (unused),
/// [8] result-type code, [9] message, [10] log messages (unused),
/// [11] image path list (optional).
pub fn decode_array(fields: &[Value]) -> Result<ShotRecord> {
    if fields.len() < MIN_ARRAY_FIELDS {
        return Err(DecodeError::ArrayTooShort {
            need: MIN_ARRAY_FIELDS,
            got: fields.len(),
        });
    }

    let result = match as_i64(&fields[8]) {
        Some(code) => {
            let kind = ResultKind::from_code(code);
            if let ResultKind::Other(code) = kind {
                warn!(code, "unknown result type code");
            }
            kind
        }
        None => return Err(bad_array(8, "integer result code")),
    };

    Ok(ShotRecord {
        carry: as_f64(&fields[0]).ok_or_else(|| bad_array(0, "number"))?,
        speed: round1(as_f64(&fields[1]).ok_or_else(|| bad_array(1, "number"))? * MPS_TO_MPH),
        launch_angle: round1(as_f64(&fields[2]).ok_or_else(|| bad_array(2, "number"))?),
        side_angle: round1(as_f64(&fields[3]).ok_or_else(|| bad_array(3, "number"))?),
        back_spin: as_f64(&fields[4]).ok_or_else(|| bad_array(4, "number"))? as i32,
        side_spin: as_f64(&fields[5]).ok_or_else(|| bad_array(5, "number"))? as i32,
        result,
        message: as_str(&fields[9]).unwrap_or_default().to_owned(),
        timestamp: now_iso8601(),
        images: fields.get(11).map(string_list).unwrap_or_default(),
        camera_source: None,
    })
}

/// Decode a map-format message against the prior record.
///
/// Copy-then-override: only keys present in `entries` are applied, the
/// timestamp is always refreshed, and everything else is inherited from
/// `current`.
pub fn decode_map(entries: &[(Value, Value)], current: &ShotRecord) -> Result<ShotRecord> {
    let mut record = current.clone();

    for (key, value) in entries {
        let Some(key) = key.as_str() else { continue };
        match key {
            "speed" => record.speed = round1(num(value, "speed")?),
            "carry" => record.carry = round1(num(value, "carry")?),
            "launch_angle" => record.launch_angle = round1(num(value, "launch_angle")?),
            "side_angle" => record.side_angle = round1(num(value, "side_angle")?),
            "back_spin" => record.back_spin = num(value, "back_spin")? as i32,
            "side_spin" => record.side_spin = num(value, "side_spin")? as i32,
            "result_type" => {
                record.result = match as_i64(value) {
                    Some(code) => {
                        let kind = ResultKind::from_code(code);
                        if let ResultKind::Other(code) = kind {
                            warn!(code, "unknown result type code");
                        }
                        kind
                    }
                    None => match as_str(value) {
                        Some(label) => ResultKind::from_label(label),
                        None => {
                            return Err(DecodeError::BadMapField {
                                key: "result_type",
                                expected: "integer or string",
                            })
                        }
                    },
                };
            }
            "message" => {
                record.message = as_str(value)
                    .map(str::to_owned)
                    .unwrap_or_else(|| value.to_string());
            }
            "image_paths" => {
                record.images = string_list(value);
            }
            _ => {}
        }
    }

    record.timestamp = now_iso8601();
    Ok(record)
}

/// Coarse physical bounds check. Failures are logged by the caller and
/// never gate the update — the record is applied and broadcast anyway.
pub fn validate(record: &ShotRecord) -> bool {
    if !(0.0..=250.0).contains(&record.speed) {
        warn!(speed = record.speed, "suspicious speed value (mph)");
        return false;
    }
    if !(-90.0..=90.0).contains(&record.launch_angle) {
        warn!(launch_angle = record.launch_angle, "suspicious launch angle");
        return false;
    }
    if !(-10_000..=10_000).contains(&record.back_spin) {
        warn!(back_spin = record.back_spin, "suspicious back spin (rpm)");
        return false;
    }
    if !(-10_000..=10_000).contains(&record.side_spin) {
        warn!(side_spin = record.side_spin, "suspicious side spin (rpm)");
        return false;
    }
    true
}

/// Probe a decoded results payload for the shot-data object.
///
/// Priority order: `result_data` under a `header`+`result_data` envelope,
/// direct physical-quantity keys at the top level, a generic `data`
/// nesting, or (for list-wrapped payloads) the first element carrying
/// physical-quantity keys. `None` means the message is not shot data.
pub fn extract_shot_payload(value: &Value) -> Option<WirePayload> {
    match value {
        Value::Map(entries) => {
            if map_get(entries, "header").is_some() {
                if let Some(Value::Map(result)) = map_get(entries, "result_data") {
                    if !result.is_empty() {
                        return Some(WirePayload::Map(result.clone()));
                    }
                }
            }
            if has_physical_keys(entries) {
                return Some(WirePayload::Map(entries.clone()));
            }
            if let Some(Value::Map(nested)) = map_get(entries, "data") {
                return Some(WirePayload::Map(nested.clone()));
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| match item {
            Value::Map(entries) if has_physical_keys(entries) => {
                Some(WirePayload::Map(entries.clone()))
            }
            _ => None,
        }),
        _ => None,
    }
}

fn has_physical_keys(entries: &[(Value, Value)]) -> bool {
    ["speed", "launch_angle", "side_angle"]
        .iter()
        .any(|key| map_get(entries, key).is_some())
}

fn map_get<'a>(entries: &'a [(Value, Value)], wanted: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(key, _)| key.as_str() == Some(wanted))
        .map(|(_, value)| value)
}

// ---------------------------------------------------------------------------
// Value coercion helpers
// ---------------------------------------------------------------------------

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => n.as_f64(),
        Value::F32(f) => Some(f64::from(*f)),
        Value::F64(f) => Some(*f),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => n.as_i64(),
        _ => None,
    }
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    }
}

fn num(value: &Value, key: &'static str) -> Result<f64> {
    as_f64(value).ok_or(DecodeError::BadMapField {
        key,
        expected: "number",
    })
}

fn bad_array(index: usize, expected: &'static str) -> DecodeError {
    DecodeError::BadArrayField { index, expected }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn array_payload() -> Vec<Value> {
        vec![
            Value::F64(250.0),              // carry (m)
            Value::F64(67.0),               // speed (m/s)
            Value::F64(14.0),               // launch angle
            Value::F64(-1.0),               // side angle
            Value::from(2800),              // backspin
            Value::from(-200),              // sidespin
            Value::F64(0.9),                // confidence (unused)
            Value::from(1),                 // club type (unused)
            Value::from(7),                 // result code: Hit
            Value::from("Great shot!"),     // message
            Value::Array(vec![]),           // log messages (unused)
        ]
    }

    #[test]
    fn array_decode_converts_speed_to_mph() {
        let mut fields = array_payload();
        fields[1] = Value::F64(44.7);
        let record = decode_array(&fields).unwrap();
        assert!((record.speed - 100.0).abs() <= 0.1, "speed = {}", record.speed);
    }

    #[test]
    fn array_decode_full_mapping() {
        let record = decode_array(&array_payload()).unwrap();
        assert_eq!(record.carry, 250.0);
        assert_eq!(record.speed, 149.9); // 67.0 * 2.237, 1 decimal
        assert_eq!(record.launch_angle, 14.0);
        assert_eq!(record.side_angle, -1.0);
        assert_eq!(record.back_spin, 2800);
        assert_eq!(record.side_spin, -200);
        assert_eq!(record.result, ResultKind::Hit);
        assert_eq!(record.message, "Great shot!");
        assert!(record.images.is_empty());
        assert!(!record.timestamp.is_empty());
    }

    #[test]
    fn array_decode_reads_optional_image_list() {
        let mut fields = array_payload();
        fields.push(Value::Array(vec![
            Value::from("shot_1.png"),
            Value::from("shot_2.png"),
        ]));
        let record = decode_array(&fields).unwrap();
        assert_eq!(record.images, vec!["shot_1.png", "shot_2.png"]);
    }

    #[test]
    fn array_decode_length_error() {
        let short = vec![Value::F64(1.0); 5];
        assert!(matches!(
            decode_array(&short),
            Err(DecodeError::ArrayTooShort { need: 11, got: 5 })
        ));
    }

    #[test]
    fn unknown_code_becomes_literal_type_string() {
        let mut fields = array_payload();
        fields[8] = Value::from(99);
        let record = decode_array(&fields).unwrap();
        assert_eq!(record.result, ResultKind::Other(99));
        assert_eq!(record.result.to_string(), "Type 99");
    }

    #[test]
    fn map_decode_preserves_absent_fields() {
        let prior = ShotRecord {
            launch_angle: 12.5,
            back_spin: 3100,
            message: "prior".into(),
            result: ResultKind::Hit,
            ..ShotRecord::initial()
        };
        let entries = vec![
            (Value::from("speed"), Value::F64(150.0)),
            (Value::from("carry"), Value::F64(250.0)),
        ];
        let record = decode_map(&entries, &prior).unwrap();
        assert_eq!(record.speed, 150.0);
        assert_eq!(record.carry, 250.0);
        assert_eq!(record.launch_angle, 12.5);
        assert_eq!(record.back_spin, 3100);
        assert_eq!(record.message, "prior");
        assert_eq!(record.result, ResultKind::Hit);
        assert_ne!(record.timestamp, prior.timestamp);
    }

    #[test]
    fn map_decode_result_type_variants() {
        let prior = ShotRecord::initial();

        let entries = vec![(Value::from("result_type"), Value::from(8))];
        let record = decode_map(&entries, &prior).unwrap();
        assert_eq!(record.result, ResultKind::Error);

        let entries = vec![(Value::from("result_type"), Value::from("Custom State"))];
        let record = decode_map(&entries, &prior).unwrap();
        assert_eq!(record.result, ResultKind::Text("Custom State".into()));

        let entries = vec![(Value::from("result_type"), Value::from(77))];
        let record = decode_map(&entries, &prior).unwrap();
        assert_eq!(record.result.to_string(), "Type 77");
    }

    #[test]
    fn map_decode_rejects_non_numeric_speed() {
        let entries = vec![(Value::from("speed"), Value::from("fast"))];
        assert!(matches!(
            decode_map(&entries, &ShotRecord::initial()),
            Err(DecodeError::BadMapField { key: "speed", .. })
        ));
    }

    #[test]
    fn validation_flags_out_of_range() {
        let mut record = ShotRecord {
            speed: 145.5,
            back_spin: 2850,
            ..ShotRecord::initial()
        };
        assert!(validate(&record));

        record.speed = 300.0;
        assert!(!validate(&record));

        record.speed = 145.5;
        record.side_spin = 15_000;
        assert!(!validate(&record));
    }

    #[test]
    fn unpack_rejects_trailing_bytes() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from(1)).unwrap();
        buf.extend_from_slice(b"junk");
        assert!(matches!(unpack(&buf), Err(DecodeError::ExtraData { extra: 4 })));
    }

    #[test]
    fn extract_prefers_result_data_envelope() {
        let payload = Value::Map(vec![
            (Value::from("header"), Value::Map(vec![])),
            (
                Value::from("result_data"),
                Value::Map(vec![(Value::from("speed"), Value::F64(150.0))]),
            ),
        ]);
        match extract_shot_payload(&payload) {
            Some(WirePayload::Map(entries)) => {
                assert_eq!(map_get(&entries, "speed"), Some(&Value::F64(150.0)));
            }
            other => panic!("unexpected extraction: {other:?}"),
        }
    }

    #[test]
    fn extract_falls_back_through_shapes() {
        // Direct physical keys.
        let direct = Value::Map(vec![(Value::from("launch_angle"), Value::F64(12.0))]);
        assert!(extract_shot_payload(&direct).is_some());

        // Generic `data` nesting.
        let nested = Value::Map(vec![(
            Value::from("data"),
            Value::Map(vec![(Value::from("other"), Value::from(1))]),
        )]);
        assert!(extract_shot_payload(&nested).is_some());

        // List-wrapped.
        let listed = Value::Array(vec![
            Value::from(3),
            Value::Map(vec![(Value::from("side_angle"), Value::F64(-2.0))]),
        ]);
        assert!(extract_shot_payload(&listed).is_some());

        // Not shot data.
        let noise = Value::Map(vec![(Value::from("status"), Value::from("ok"))]);
        assert!(extract_shot_payload(&noise).is_none());
        assert!(extract_shot_payload(&Value::from(17)).is_none());
    }
}
