//! Telemetry payload validation.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. Size limit
//! 2. Payload is a mapping
//! 3. `device_id` (or legacy `device`) present and well formed
//! 4. `timestamp`, if present, parses as ISO-8601
//! 5. `status`, if present, is a known status
//! 6. `sensors`, if present, is a mapping

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use super::{PayloadRejection, TelemetryError};
use crate::issuance::validate_device_id;
use crate::storage::{DeviceStatus, SensorMap, TelemetrySample};

/// Largest accepted payload, measured as serialized JSON.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

const DEVICE_ID_FIELDS: &[&str] = &["device_id", "device"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Size-check and decode raw JSON text.
pub fn decode_payload(raw: &str) -> Result<Value, TelemetryError> {
    if raw.len() > MAX_PAYLOAD_BYTES {
        return Err(too_large(raw.len()));
    }
    serde_json::from_str(raw)
        .map_err(|e| TelemetryError::invalid(PayloadRejection::MalformedJson, e.to_string()))
}

/// Parse raw JSON text and validate it.
pub fn parse_payload(raw: &str, received_at: DateTime<Utc>) -> Result<TelemetrySample, TelemetryError> {
    validate_payload(&decode_payload(raw)?, received_at)
}

/// Validate a decoded payload into a sample stamped with `received_at`.
pub fn validate_payload(payload: &Value, received_at: DateTime<Utc>) -> Result<TelemetrySample, TelemetryError> {
    let size = serde_json::to_vec(payload).map(|bytes| bytes.len()).unwrap_or(0);
    if size > MAX_PAYLOAD_BYTES {
        return Err(too_large(size));
    }

    let Value::Object(fields) = payload else {
        return Err(TelemetryError::invalid(
            PayloadRejection::NotAMapping,
            format!("expected a JSON object, got {}", type_name(payload)),
        ));
    };

    let device_id = DEVICE_ID_FIELDS
        .iter()
        .find_map(|field| fields.get(*field).filter(|v| !v.is_null()))
        .ok_or_else(|| TelemetryError::invalid(PayloadRejection::MissingDeviceId, "device_id is required"))?;
    let device_id = match device_id {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        other => {
            return Err(TelemetryError::invalid(
                PayloadRejection::InvalidDeviceId,
                format!("device_id must be a non-empty string, got {}", type_name(other)),
            ))
        }
    };
    validate_device_id(&device_id)
        .map_err(|e| TelemetryError::invalid(PayloadRejection::InvalidDeviceId, e.to_string()))?;

    let timestamp = match fields.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(parse_timestamp(s).ok_or_else(|| {
            TelemetryError::invalid(
                PayloadRejection::InvalidTimestamp,
                format!("'{}' is not an ISO-8601 timestamp", s),
            )
        })?),
        Some(other) => {
            return Err(TelemetryError::invalid(
                PayloadRejection::InvalidTimestamp,
                format!("timestamp must be a string, got {}", type_name(other)),
            ))
        }
    };

    let status = match fields.get("status") {
        None | Some(Value::Null) => DeviceStatus::Online,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|e: String| TelemetryError::invalid(PayloadRejection::InvalidStatus, e))?,
        Some(other) => {
            return Err(TelemetryError::invalid(
                PayloadRejection::InvalidStatus,
                format!("status must be a string, got {}", type_name(other)),
            ))
        }
    };

    let sensors = match fields.get("sensors") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(
            map.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<SensorMap>(),
        ),
        Some(other) => {
            return Err(TelemetryError::invalid(
                PayloadRejection::SensorsNotAMapping,
                format!("sensors must be a JSON object, got {}", type_name(other)),
            ))
        }
    };

    Ok(TelemetrySample {
        device_id,
        timestamp,
        status,
        sensors,
        received_at,
    })
}

/// ISO-8601 with or without offset; offset-less values are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn too_large(size: usize) -> TelemetryError {
    TelemetryError::invalid(
        PayloadRejection::TooLarge,
        format!("{} bytes exceeds limit of {}", size, MAX_PAYLOAD_BYTES),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn rejection(payload: Value) -> PayloadRejection {
        validate_payload(&payload, now()).unwrap_err().rejection().unwrap()
    }

    #[test]
    fn test_full_payload() {
        let sample = validate_payload(
            &json!({
                "device_id": "pi-01",
                "timestamp": "2026-03-01T11:59:00Z",
                "status": "Degraded",
                "sensors": {"cpu": {"temp_celsius": 51.5}}
            }),
            now(),
        )
        .unwrap();
        assert_eq!(sample.device_id, "pi-01");
        assert_eq!(sample.status, DeviceStatus::Degraded);
        assert_eq!(sample.timestamp, Some(Utc.with_ymd_and_hms(2026, 3, 1, 11, 59, 0).unwrap()));
        assert_eq!(sample.sensors.unwrap()["cpu"]["temp_celsius"], json!(51.5));
        assert_eq!(sample.received_at, now());
    }

    #[test]
    fn test_minimal_payload_defaults() {
        let sample = validate_payload(&json!({"device": "d1"}), now()).unwrap();
        assert_eq!(sample.device_id, "d1");
        assert_eq!(sample.status, DeviceStatus::Online);
        assert!(sample.timestamp.is_none());
        assert!(sample.sensors.is_none());
    }

    #[test]
    fn test_rejections_in_order() {
        assert_eq!(rejection(json!([1, 2])), PayloadRejection::NotAMapping);
        assert_eq!(rejection(json!("d1")), PayloadRejection::NotAMapping);
        assert_eq!(rejection(json!({"timestamp": "bad"})), PayloadRejection::MissingDeviceId);
        assert_eq!(rejection(json!({"device_id": 7})), PayloadRejection::InvalidDeviceId);
        assert_eq!(rejection(json!({"device_id": "  "})), PayloadRejection::InvalidDeviceId);
        assert_eq!(
            rejection(json!({"device_id": "d1", "timestamp": "not-a-date", "sensors": 5})),
            PayloadRejection::InvalidTimestamp
        );
        assert_eq!(rejection(json!({"device_id": "d1", "status": "exploded"})), PayloadRejection::InvalidStatus);
        assert_eq!(rejection(json!({"device_id": "d1", "sensors": [1, 2]})), PayloadRejection::SensorsNotAMapping);
        assert_eq!(rejection(json!({"device_id": "d1", "sensors": "hot"})), PayloadRejection::SensorsNotAMapping);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-01T10:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T12:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01 10:30:00.000"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T10:30"), Some(expected));
        assert!(parse_timestamp("2026-03-01").is_some());
        assert!(parse_timestamp("not-a-date").is_none());
        assert!(parse_timestamp("2026-13-01T00:00:00").is_none());
    }

    #[test]
    fn test_raw_text() {
        assert_eq!(
            parse_payload("{not json", now()).unwrap_err().reason_code(),
            "MALFORMED_JSON"
        );
        let big = format!("{{\"device_id\":\"d1\",\"pad\":\"{}\"}}", "x".repeat(MAX_PAYLOAD_BYTES));
        assert_eq!(parse_payload(&big, now()).unwrap_err().reason_code(), "PAYLOAD_TOO_LARGE");
        assert!(parse_payload(r#"{"device_id":"d1"}"#, now()).is_ok());
    }
}
