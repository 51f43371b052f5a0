//! Telemetry record and its wire payload.

use anyhow::{Context, Result};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";

/// Declared for the device profile; the node never subscribes to it.
pub const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One cycle's readings, serialized as compact JSON with fixed decimals:
///
/// ```text
/// {"treeId":1,"bootCnt":42,"soilTemperature":21.35,"soilMoisture":94.47,"batVoltage":3.876}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryRecord {
    #[serde(rename = "treeId")]
    pub device_id: u32,
    #[serde(rename = "bootCnt")]
    pub boot_epoch: u32,
    #[serde(rename = "soilTemperature", serialize_with = "two_decimals")]
    pub soil_temperature_c: f32,
    #[serde(rename = "soilMoisture", serialize_with = "two_decimals")]
    pub soil_moisture_percent: f32,
    #[serde(rename = "batVoltage", serialize_with = "three_decimals")]
    pub battery_voltage_v: f32,
}

impl TelemetryRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize telemetry record")
    }
}

fn two_decimals<S: Serializer>(value: &f32, s: S) -> Result<S::Ok, S::Error> {
    fixed_decimals(*value, 2, s)
}

fn three_decimals<S: Serializer>(value: &f32, s: S) -> Result<S::Ok, S::Error> {
    fixed_decimals(*value, 3, s)
}

/// Emit `value` as a JSON number with exactly `decimals` fractional digits,
/// keeping trailing zeros (`21.30`, not `21.3`).
fn fixed_decimals<S: Serializer>(value: f32, decimals: usize, s: S) -> Result<S::Ok, S::Error> {
    if !value.is_finite() {
        return Err(S::Error::custom(format!("non-finite reading: {value}")));
    }
    let raw = RawValue::from_string(format!("{value:.decimals$}")).map_err(S::Error::custom)?;
    raw.serialize(s)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TelemetryRecord {
        TelemetryRecord {
            device_id: 1,
            boot_epoch: 42,
            soil_temperature_c: 21.346,
            soil_moisture_percent: 94.474,
            battery_voltage_v: 3.8761,
        }
    }

    #[test]
    fn serializes_exact_payload() {
        assert_eq!(
            record().to_json().unwrap(),
            r#"{"treeId":1,"bootCnt":42,"soilTemperature":21.35,"soilMoisture":94.47,"batVoltage":3.876}"#
        );
    }

    #[test]
    fn keeps_trailing_zeros() {
        let r = TelemetryRecord {
            soil_temperature_c: 21.3,
            soil_moisture_percent: 100.0,
            battery_voltage_v: 4.1,
            ..record()
        };
        let json = r.to_json().unwrap();
        assert!(json.contains(r#""soilTemperature":21.30"#), "{json}");
        assert!(json.contains(r#""soilMoisture":100.00"#), "{json}");
        assert!(json.contains(r#""batVoltage":4.100"#), "{json}");
    }

    #[test]
    fn negative_temperature() {
        let r = TelemetryRecord {
            soil_temperature_c: -3.456,
            ..record()
        };
        let json = r.to_json().unwrap();
        assert!(json.contains(r#""soilTemperature":-3.46"#), "{json}");
    }

    #[test]
    fn output_is_valid_json_with_exactly_five_fields() {
        let json = record().to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        assert_eq!(v["treeId"], 1);
        assert_eq!(v["bootCnt"], 42);
    }

    #[test]
    fn no_whitespace_in_payload() {
        let json = record().to_json().unwrap();
        assert!(!json.contains(' '));
    }

    #[test]
    fn non_finite_reading_fails_to_serialize() {
        let r = TelemetryRecord {
            battery_voltage_v: f32::NAN,
            ..record()
        };
        assert!(r.to_json().is_err());
    }
}
