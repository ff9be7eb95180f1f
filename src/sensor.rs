//! Sensor field extraction for ATC thermometer advertisements.
//!
//! The thermometer broadcasts its readings in a "Service Data - 16-bit UUID"
//! structure. Offsets below index the structure payload, UUID included:
//!
//! | bytes     | field                                |
//! |-----------|--------------------------------------|
//! | `[0,2)`   | service UUID `0x181A`, little-endian |
//! | `[2,8)`   | device MAC                           |
//! | `[8,10)`  | temperature, BE signed, 0.1 °C       |
//! | `[10]`    | humidity, %                          |
//! | `[11]`    | battery, %                           |
//! | `[12,14)` | battery voltage, BE, mV              |
//! | `[14]`    | frame counter (optional)             |

use crate::advertising::AdvertisingData;
use crate::reading::SensorReading;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Environmental Sensing service UUID used by the thermometer firmware.
pub const ATC_SERVICE_UUID: u16 = 0x181A;

/// Shortest service-data payload that carries every sensor field.
pub const MIN_PAYLOAD_LEN: usize = 14;

const FRAME_COUNTER_OFFSET: usize = 14;

/// Errors turning an advertisement into a reading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Service data present but too short for field extraction
    #[error("Malformed payload: {len} bytes, need at least {MIN_PAYLOAD_LEN}")]
    MalformedPayload { len: usize },
    /// Frame carried no service data structure
    #[error("No service data in advertisement")]
    MissingServiceData,
}

/// Decode the sensor fields of a service-data payload.
///
/// `received_at` becomes the reading's timestamp.
pub fn extract_reading(
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<SensorReading, DecodeError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::MalformedPayload { len: payload.len() });
    }

    let raw_temperature = i16::from_be_bytes([payload[8], payload[9]]);

    Ok(SensorReading {
        temperature: f64::from(raw_temperature) / 10.0,
        humidity: payload[10],
        battery: payload[11],
        voltage: u16::from_be_bytes([payload[12], payload[13]]),
        timestamp: received_at,
    })
}

/// Decode the reading carried by a parsed advertising frame.
///
/// Structures other than service data are ignored.
pub fn decode_advertisement(
    data: &AdvertisingData<'_>,
    received_at: DateTime<Utc>,
) -> Result<SensorReading, DecodeError> {
    let payload = data.service_data().ok_or(DecodeError::MissingServiceData)?;
    extract_reading(payload, received_at)
}

/// Service UUID prefix of a service-data payload, if present.
pub fn service_uuid(payload: &[u8]) -> Option<u16> {
    match payload {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Frame counter byte, incremented by the firmware on every new measurement.
pub fn frame_counter(payload: &[u8]) -> Option<u8> {
    payload.get(FRAME_COUNTER_OFFSET).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertising::parse_frame;
    use crate::test_utils::{atc_frame, atc_service_data, received_at};

    #[test]
    fn test_extract_reference_payload() {
        let payload = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // prefix
            0x00, 0xE1, // 225 -> 22.5 °C
            0x3C, // 60 %
            0x50, // 80 %
            0x0A, 0xF0, // 2800 mV
        ];

        let reading = extract_reading(&payload, received_at()).unwrap();
        assert_eq!(reading.temperature, 22.5);
        assert_eq!(reading.humidity, 60);
        assert_eq!(reading.battery, 80);
        assert_eq!(reading.voltage, 2800);
        assert_eq!(reading.timestamp, received_at());
    }

    #[test]
    fn test_extract_negative_temperature() {
        let mut payload = atc_service_data();
        payload[8..10].copy_from_slice(&(-57i16).to_be_bytes());

        let reading = extract_reading(&payload, received_at()).unwrap();
        assert_eq!(reading.temperature, -5.7);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let payload = atc_service_data();
        for len in 0..MIN_PAYLOAD_LEN {
            assert_eq!(
                extract_reading(&payload[..len], received_at()),
                Err(DecodeError::MalformedPayload { len })
            );
        }
    }

    #[test]
    fn test_decode_advertisement_from_frame() {
        let frame = atc_frame();
        let parsed = parse_frame(&frame);

        let reading = decode_advertisement(&parsed, received_at()).unwrap();
        assert_eq!(reading.temperature, 22.5);
        assert_eq!(reading.voltage, 2800);
    }

    #[test]
    fn test_decode_advertisement_without_service_data() {
        let parsed = parse_frame(&[0x02, 0x01, 0x06, 0x03, 0xFF, 0x99, 0x04]);
        assert_eq!(
            decode_advertisement(&parsed, received_at()),
            Err(DecodeError::MissingServiceData)
        );
    }

    #[test]
    fn test_service_uuid_and_frame_counter() {
        let payload = atc_service_data();
        assert_eq!(service_uuid(&payload), Some(ATC_SERVICE_UUID));
        assert_eq!(frame_counter(&payload), Some(0x2A));
        assert_eq!(frame_counter(&payload[..MIN_PAYLOAD_LEN]), None);
        assert_eq!(service_uuid(&[0x1A]), None);
    }

    #[test]
    fn test_decode_error_display() {
        assert_eq!(
            DecodeError::MalformedPayload { len: 3 }.to_string(),
            "Malformed payload: 3 bytes, need at least 14"
        );
        assert_eq!(
            DecodeError::MissingServiceData.to_string(),
            "No service data in advertisement"
        );
    }
}
