use crate::advertising::{AD_TYPE_SERVICE_DATA_16, encode_structures};
use crate::mac_address::MacAddress;
use crate::reading::SensorReading;
use chrono::{DateTime, TimeZone, Utc};

/// Address of the thermometer the fixtures describe.
pub const TEST_MAC: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x0F, 0x31, 0x17]);

/// Service-data payload: 22.5 °C, 60 %, 80 %, 2800 mV, frame counter 42.
pub fn atc_service_data() -> Vec<u8> {
    let mut payload = vec![0x1A, 0x18]; // UUID 0x181A, little-endian
    payload.extend_from_slice(&TEST_MAC.0);
    payload.extend_from_slice(&[0x00, 0xE1, 0x3C, 0x50, 0x0A, 0xF0, 0x2A]);
    payload
}

/// Full advertising frame: flags followed by the service-data structure.
pub fn atc_frame() -> Vec<u8> {
    let service = atc_service_data();
    encode_structures([(0x01, &[0x06][..]), (AD_TYPE_SERVICE_DATA_16, &service[..])])
}

pub fn received_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// The reading [`atc_frame`] decodes to.
pub fn sample_reading() -> SensorReading {
    SensorReading {
        temperature: 22.5,
        humidity: 60,
        battery: 80,
        voltage: 2800,
        timestamp: received_at(),
    }
}
