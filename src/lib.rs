//! `atc-forwarder` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The scan → decode → deliver loop lives in
//! [`crate::app`] where it can be tested with an injected scanner and
//! transport.

pub mod advertising;
pub mod app;
pub mod delivery;
pub mod duration;
pub mod mac_address;
pub mod pipeline;
pub mod reading;
pub mod scanner;
pub mod sensor;
pub mod shutdown;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertising::{AdStructure, AdStructures, AdvertisingData, parse_frame};
pub use delivery::{
    DeliveryClient, DeliveryOutcome, HttpTransport, RetryPolicy, Transport, TransportError,
};
pub use mac_address::{DeviceFilter, MacAddress};
pub use pipeline::{EventOutcome, Pipeline};
pub use reading::SensorReading;
pub use scanner::{Backend, DiscoveryEvent, DiscoveryKind, ScanError};
pub use sensor::{DecodeError, decode_advertisement, extract_reading};
pub use shutdown::{Shutdown, ShutdownTrigger};
