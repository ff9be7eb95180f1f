//! Raw HCI socket backend.
//!
//! Runs a passive LE scan directly on `hci0` without the BlueZ daemon and
//! forwards the AD bytes of every advertising report. Needs CAP_NET_RAW and
//! CAP_NET_ADMIN (or root).

use super::{DISCOVERY_CHANNEL_BUFFER_SIZE, DiscoveryEvent, ScanError, SeenDevices};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_DEV_ID: u16 = 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
/// 10 ms in 0.625 ms units
const SCAN_INTERVAL: u16 = 0x0010;

/// Largest HCI event: 3 header bytes + 255 parameter bytes.
const MAX_EVENT_SIZE: usize = 258;

// Offsets into an LE advertising report event, packet type byte included.
const REPORT_ADDR: usize = 7;
const REPORT_DATA_LEN: usize = 13;
const REPORT_DATA: usize = 14;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[derive(Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter passing only LE meta events.
    fn le_meta_events() -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

/// Encode an HCI command packet.
fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = ((ogf << 10) | ocf).to_le_bytes();
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn scan_parameters_packet() -> Vec<u8> {
    let interval = SCAN_INTERVAL.to_le_bytes();
    let params = [
        LE_SCAN_PASSIVE,
        interval[0],
        interval[1],
        interval[0], // window == interval
        interval[1],
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ];
    command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)
}

fn scan_enable_packet() -> Vec<u8> {
    // enable, keep duplicates
    command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00])
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// A raw HCI socket bound to one controller.
struct HciSocket(OwnedFd);

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd.
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("Failed to create HCI socket"));
        }
        let socket = Self(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.0.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to bind HCI socket"));
        }

        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to set HCI filter"));
        }
        Ok(())
    }

    fn send(&self, packet: &[u8]) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to send HCI command"));
        }
        Ok(())
    }
}

/// Extract sender address and AD bytes from an LE advertising report event.
///
/// Only the first report of a multi-report event is read.
fn parse_advertising_report(packet: &[u8]) -> Option<(MacAddress, &[u8])> {
    if packet.len() <= REPORT_DATA_LEN
        || packet[0] != HCI_EVENT_PKT
        || packet[1] != EVT_LE_META_EVENT
        || packet[3] != EVT_LE_ADVERTISING_REPORT
        || packet[4] == 0
    {
        return None;
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&packet[REPORT_ADDR..REPORT_ADDR + 6]);
    addr.reverse(); // little-endian on the wire

    let data_len = usize::from(packet[REPORT_DATA_LEN]);
    let data = packet.get(REPORT_DATA..REPORT_DATA + data_len)?;

    Some((MacAddress(addr), data))
}

/// Start a passive LE scan on `hci0`.
pub async fn start_scan() -> Result<mpsc::Receiver<DiscoveryEvent>, ScanError> {
    let events = HciSocket::open(HCI_DEV_ID)?;
    events.set_filter(&HciFilter::le_meta_events())?;

    let commands = HciSocket::open(HCI_DEV_ID)?;
    commands.send(&scan_parameters_packet())?;
    commands.send(&scan_enable_packet())?;

    let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(events.0)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

    tokio::spawn(async move {
        let _commands = commands;
        let mut seen = SeenDevices::new();
        let mut buf = [0u8; MAX_EVENT_SIZE];

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "HCI socket failed, stopping scan");
                    return;
                }
            };

            // Drain everything buffered before waiting again.
            loop {
                let read = guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                });

                let n = match read {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) | Err(_) => break,
                    Ok(Err(e)) => {
                        debug!(error = %e, "HCI read failed");
                        break;
                    }
                };

                let Some((address, data)) = parse_advertising_report(&buf[..n]) else {
                    continue;
                };
                let Some(event) = seen.event(address, data.to_vec()) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(rx)
}
