//! Sensor reading data structure and its collector wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single reading from the tracked thermometer.
///
/// Serializes to the JSON body the collector's create endpoint accepts:
///
/// ```json
/// {"temperature":22.5,"humidity":60,"battery":80,"voltage":2800,"timestamp":"2024-05-01T12:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Temperature in Celsius, 0.1 degree resolution
    pub temperature: f64,
    /// Relative humidity in percent (0-100)
    pub humidity: u8,
    /// Battery level in percent (0-100)
    pub battery: u8,
    /// Battery voltage in millivolts
    pub voltage: u16,
    /// Receipt time; the broadcaster does not send one
    #[serde(with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Encode as the collector's JSON body.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

/// ISO-8601 timestamps with an explicit `Z` suffix.
mod utc_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_reading;
    use chrono::TimeZone;

    #[test]
    fn test_wire_field_names_and_values() {
        let reading = sample_reading();
        let value: serde_json::Value = serde_json::to_value(&reading).unwrap();

        assert_eq!(value["temperature"], 22.5);
        assert_eq!(value["humidity"], 60);
        assert_eq!(value["battery"], 80);
        assert_eq!(value["voltage"], 2800);
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(value.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_timestamp_keeps_subsecond_precision_with_z_suffix() {
        let mut reading = sample_reading();
        reading.timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456);

        let json = reading.to_json().unwrap();
        assert!(json.contains("\"timestamp\":\"2024-05-01T12:00:00.123456Z\""));
    }

    #[test]
    fn test_round_trip_reproduces_fields() {
        let mut reading = sample_reading();
        reading.temperature = -3.7;
        reading.timestamp = Utc::now();

        let parsed = SensorReading::from_json(&reading.to_json().unwrap()).unwrap();
        assert_eq!(parsed, reading);
    }

    #[test]
    fn test_accepts_offset_timestamps_from_collector() {
        let body = r#"{"temperature":22.5,"humidity":60,"battery":80,"voltage":2800,"timestamp":"2024-05-01T14:00:00+02:00"}"#;
        let parsed = SensorReading::from_json(body).unwrap();
        assert_eq!(parsed, sample_reading());
    }

    #[test]
    fn test_rejects_malformed_timestamp() {
        let body = r#"{"temperature":22.5,"humidity":60,"battery":80,"voltage":2800,"timestamp":"yesterday"}"#;
        assert!(SensorReading::from_json(body).is_err());
    }
}
