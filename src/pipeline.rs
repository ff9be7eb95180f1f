//! Per-event processing and the delivery worker.
//!
//! [`Pipeline::handle`] runs synchronously for each discovery event: filter,
//! parse, extract, enqueue. It never waits on the network. Readings are
//! handed to [`run_delivery_worker`] through a bounded queue, so a stalled
//! collector cannot slow down the scanner.

use crate::advertising::parse_frame;
use crate::delivery::{DeliveryClient, DeliveryOutcome, Transport};
use crate::mac_address::DeviceFilter;
use crate::reading::SensorReading;
use crate::scanner::{DiscoveryEvent, DiscoveryKind};
use crate::sensor::{DecodeError, decode_advertisement, frame_counter};
use crate::shutdown::Shutdown;
use chrono::Utc;
use std::fmt::Write;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

/// Default capacity of the delivery queue.
pub const DEFAULT_QUEUE_SIZE: usize = 16;

/// What happened to a single discovery event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Not the tracked device
    Ignored,
    /// First sighting of the tracked device; nothing to decode
    Acknowledged,
    /// Advertisement could not be turned into a reading
    Skipped(DecodeError),
    /// Reading handed to the delivery worker
    Queued,
    /// Delivery queue full; reading dropped
    QueueFull,
    /// Delivery worker gone; reading dropped
    QueueClosed,
}

/// Counters over [`EventOutcome`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ignored: u64,
    pub acknowledged: u64,
    pub skipped: u64,
    pub queued: u64,
    pub dropped: u64,
}

impl PipelineStats {
    pub fn record(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Ignored => self.ignored += 1,
            EventOutcome::Acknowledged => self.acknowledged += 1,
            EventOutcome::Skipped(_) => self.skipped += 1,
            EventOutcome::Queued => self.queued += 1,
            EventOutcome::QueueFull | EventOutcome::QueueClosed => self.dropped += 1,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Filter → parse → extract → enqueue for one tracked device.
#[derive(Debug)]
pub struct Pipeline {
    filter: DeviceFilter,
    queue: mpsc::Sender<SensorReading>,
}

impl Pipeline {
    pub fn new(filter: DeviceFilter, queue: mpsc::Sender<SensorReading>) -> Self {
        Self { filter, queue }
    }

    pub fn handle(&self, event: &DiscoveryEvent) -> EventOutcome {
        let address = event.address;
        if !self.filter.matches(&address) {
            trace!(%address, "ignoring advertisement from other device");
            return EventOutcome::Ignored;
        }

        if event.kind == DiscoveryKind::NewDevice {
            info!(%address, "discovered target device");
            return EventOutcome::Acknowledged;
        }

        debug!(%address, raw = %hex(&event.data), "received advertising data from target device");
        let parsed = parse_frame(&event.data);
        for (ad_type, payload) in parsed.iter() {
            debug!(%address, ad_type, payload = %hex(payload), "AD structure");
        }

        let reading = match decode_advertisement(&parsed, Utc::now()) {
            Ok(reading) => reading,
            Err(e @ DecodeError::MissingServiceData) => {
                debug!(%address, "advertisement carries no sensor data");
                return EventOutcome::Skipped(e);
            }
            Err(e) => {
                warn!(%address, error = %e, "skipping malformed advertisement");
                return EventOutcome::Skipped(e);
            }
        };

        info!(
            %address,
            temperature = reading.temperature,
            humidity = reading.humidity,
            battery = reading.battery,
            voltage = reading.voltage,
            counter = parsed.service_data().and_then(frame_counter),
            "decoded reading"
        );

        match self.queue.try_send(reading) {
            Ok(()) => EventOutcome::Queued,
            Err(TrySendError::Full(reading)) => {
                error!(%address, ?reading, "delivery queue full, reading dropped");
                EventOutcome::QueueFull
            }
            Err(TrySendError::Closed(reading)) => {
                error!(%address, ?reading, "delivery worker stopped, reading dropped");
                EventOutcome::QueueClosed
            }
        }
    }
}

/// Counters over delivery results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub dropped: u64,
    /// In flight when shutdown arrived
    pub interrupted: u64,
    /// Still queued when shutdown arrived
    pub abandoned: u64,
}

/// Deliver queued readings one at a time until the queue closes or shutdown.
///
/// A closed queue is drained first. On shutdown the in-flight retry is cut
/// short and every reading left unsent is logged with its JSON body.
pub async fn run_delivery_worker<T: Transport>(
    client: DeliveryClient<T>,
    mut queue: mpsc::Receiver<SensorReading>,
    mut shutdown: Shutdown,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();

    loop {
        let reading = tokio::select! {
            biased;
            _ = shutdown.requested() => break,
            reading = queue.recv() => match reading {
                Some(reading) => reading,
                None => break,
            },
        };

        match client.deliver(reading, &mut shutdown).await {
            DeliveryOutcome::Delivered { .. } => stats.delivered += 1,
            DeliveryOutcome::DroppedAfterRetries { .. } | DeliveryOutcome::Unencodable { .. } => {
                stats.dropped += 1;
            }
            DeliveryOutcome::Interrupted { attempts, reading } => {
                error!(
                    attempts,
                    reading = %reading.to_json().unwrap_or_default(),
                    "shutdown during retry, reading not delivered"
                );
                stats.interrupted += 1;
                break;
            }
        }
    }

    queue.close();
    while let Ok(reading) = queue.try_recv() {
        warn!(
            reading = %reading.to_json().unwrap_or_default(),
            "reading not delivered before shutdown"
        );
        stats.abandoned += 1;
    }

    stats
}
