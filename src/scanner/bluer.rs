//! BlueZ D-Bus backend.
//!
//! Uses an advertisement monitor matching ATC service data, then follows
//! service-data property changes of each matched device. BlueZ hands out
//! service data already split per UUID, so it is re-encoded into AD
//! structures before being published.

use super::{DISCOVERY_CHANNEL_BUFFER_SIZE, DiscoveryEvent, DiscoveryKind, ScanError, SeenDevices};
use crate::advertising::{AD_TYPE_SERVICE_DATA_16, encode_structures};
use crate::mac_address::MacAddress;
use crate::sensor::ATC_SERVICE_UUID;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bluetooth base UUID with the 32-bit prefix cleared.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// 16-bit alias of a UUID derived from the Bluetooth base UUID.
fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Rebuild the service-data structures of an advertisement.
///
/// Entries with full 128-bit UUIDs are skipped; output is ordered by UUID.
fn service_data_frame(service_data: &HashMap<Uuid, Vec<u8>>) -> Vec<u8> {
    let mut payloads: Vec<Vec<u8>> = service_data
        .iter()
        .filter_map(|(uuid, data)| {
            let short = short_uuid(uuid)?;
            let mut payload = short.to_le_bytes().to_vec();
            payload.extend_from_slice(data);
            Some(payload)
        })
        .collect();
    payloads.sort();

    encode_structures(
        payloads
            .iter()
            .map(|p| (AD_TYPE_SERVICE_DATA_16, p.as_slice())),
    )
}

/// Start scanning via BlueZ.
pub async fn start_scan() -> Result<mpsc::Receiver<DiscoveryEvent>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_BUFFER_SIZE);

    let pattern = Pattern {
        data_type: AD_TYPE_SERVICE_DATA_16,
        start_position: 0,
        content: ATC_SERVICE_UUID.to_le_bytes().to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    tokio::spawn(async move {
        // Bluetooth state must outlive the event loop.
        let _session = session;
        let _monitor_manager = monitor_manager;
        let mut seen = SeenDevices::new();

        while let Some(event) = monitor_handle.next().await {
            let MonitorEvent::DeviceFound(device_id) = event else {
                continue;
            };
            let address = device_id.device;
            let kind = seen.classify(address.into());

            if let Err(e) = publish_current(&adapter, address, kind, &tx).await {
                warn!(%address, error = %e, "failed to read advertisement");
                continue;
            }
            if kind == DiscoveryKind::NewDevice {
                tokio::spawn(follow_device(adapter.clone(), address, tx.clone()));
            }
            if tx.is_closed() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Publish the service data BlueZ currently holds for a device.
async fn publish_current(
    adapter: &Adapter,
    address: Address,
    kind: DiscoveryKind,
    tx: &mpsc::Sender<DiscoveryEvent>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let Some(service_data) = device.service_data().await? else {
        return Ok(());
    };

    let event = DiscoveryEvent {
        address: address.into(),
        kind,
        data: service_data_frame(&service_data),
    };
    let _ = tx.send(event).await;
    Ok(())
}

/// Forward service-data updates of a known device until it goes away.
async fn follow_device(adapter: Adapter, address: Address, tx: mpsc::Sender<DiscoveryEvent>) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            warn!(%address, error = %e, "cannot follow device updates");
            return;
        }
    };
    let mut events = match device.events().await {
        Ok(events) => Box::pin(events),
        Err(e) => {
            warn!(%address, error = %e, "cannot follow device updates");
            return;
        }
    };

    let mac: MacAddress = address.into();
    while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
        if let DeviceProperty::ServiceData(service_data) = property {
            let event = DiscoveryEvent {
                address: mac,
                kind: DiscoveryKind::NewData,
                data: service_data_frame(&service_data),
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
    debug!(%address, "device event stream ended");
}
