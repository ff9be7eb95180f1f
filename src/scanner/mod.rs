//! BLE discovery event sources.
//!
//! Backends publish one [`DiscoveryEvent`] per received advertisement on a
//! bounded channel. They do not decode anything; the pipeline owns filtering
//! and parsing.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Channel buffer size for discovery events.
pub const DISCOVERY_CHANNEL_BUFFER_SIZE: usize = 100;

/// Whether a broadcaster is new to this scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// First advertisement seen from this address
    NewDevice,
    /// Further advertising data from an address seen before
    NewData,
}

/// One advertisement as reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub address: MacAddress,
    pub kind: DiscoveryKind,
    /// Raw advertising frame (`[len][type][payload]...`)
    pub data: Vec<u8>,
}

/// Tracks the addresses seen in this session and the last frame of each.
#[derive(Debug, Default)]
pub struct SeenDevices(HashMap<MacAddress, Vec<u8>>);

impl SeenDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a sighting by address alone and remember its sender.
    pub fn classify(&mut self, address: MacAddress) -> DiscoveryKind {
        if self.0.contains_key(&address) {
            DiscoveryKind::NewData
        } else {
            self.0.insert(address, Vec::new());
            DiscoveryKind::NewDevice
        }
    }

    /// Turn a received frame into an event.
    ///
    /// Returns `None` when the frame repeats the last one from the same
    /// address, so rebroadcasts are not reported as new data.
    pub fn event(&mut self, address: MacAddress, data: Vec<u8>) -> Option<DiscoveryEvent> {
        let kind = match self.0.get_mut(&address) {
            Some(last) if *last == data => return None,
            Some(last) => {
                last.clone_from(&data);
                DiscoveryKind::NewData
            }
            None => {
                self.0.insert(address, data.clone());
                DiscoveryKind::NewDevice
            }
        };
        Some(DiscoveryEvent {
            address,
            kind,
            data,
        })
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Start scanning with the given backend.
///
/// The returned receiver yields events until the backend's scan task ends.
pub async fn start_scan(backend: Backend) -> Result<mpsc::Receiver<DiscoveryEvent>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, atc_frame};
    use std::str::FromStr;

    #[test]
    fn test_first_sighting_is_new_device() {
        let mut seen = SeenDevices::new();
        let other = MacAddress([1, 2, 3, 4, 5, 6]);

        assert_eq!(seen.classify(TEST_MAC), DiscoveryKind::NewDevice);
        assert_eq!(seen.classify(TEST_MAC), DiscoveryKind::NewData);
        assert_eq!(seen.classify(other), DiscoveryKind::NewDevice);
        assert_eq!(seen.classify(TEST_MAC), DiscoveryKind::NewData);
    }

    #[test]
    fn test_event_carries_frame() {
        let mut seen = SeenDevices::new();
        let event = seen.event(TEST_MAC, vec![0x02, 0x01, 0x06]).unwrap();
        assert_eq!(event.address, TEST_MAC);
        assert_eq!(event.kind, DiscoveryKind::NewDevice);
        assert_eq!(event.data, vec![0x02, 0x01, 0x06]);
    }

    #[test]
    fn test_repeated_frame_is_not_new_data() {
        let mut seen = SeenDevices::new();
        let frame = atc_frame();

        assert_eq!(
            seen.event(TEST_MAC, frame.clone()).map(|e| e.kind),
            Some(DiscoveryKind::NewDevice)
        );
        for _ in 0..5 {
            assert_eq!(seen.event(TEST_MAC, frame.clone()), None);
        }

        let mut changed = frame.clone();
        let last = changed.len() - 1;
        changed[last] = changed[last].wrapping_add(1);
        let event = seen.event(TEST_MAC, changed.clone()).unwrap();
        assert_eq!(event.kind, DiscoveryKind::NewData);
        assert_eq!(event.data, changed);

        assert_eq!(seen.event(TEST_MAC, changed), None);
        assert_eq!(
            seen.event(TEST_MAC, frame).map(|e| e.kind),
            Some(DiscoveryKind::NewData)
        );
    }

    #[test]
    fn test_frames_are_tracked_per_address() {
        let mut seen = SeenDevices::new();
        let other = MacAddress([1, 2, 3, 4, 5, 6]);
        let frame = atc_frame();

        assert!(seen.event(TEST_MAC, frame.clone()).is_some());
        let event = seen.event(other, frame.clone()).unwrap();
        assert_eq!(event.kind, DiscoveryKind::NewDevice);
        assert_eq!(seen.event(other, frame), None);
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("adapter not found".to_string());
        assert_eq!(err.to_string(), "Bluetooth error: adapter not found");
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("bluer").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("BlueZ").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("hci").unwrap(), Backend::Hci);
        assert_eq!(Backend::from_str("raw").unwrap(), Backend::Hci);
        assert!(Backend::from_str("invalid").is_err());
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::Bluer.to_string(), "bluer");
        assert_eq!(Backend::Hci.to_string(), "hci");
    }
}
