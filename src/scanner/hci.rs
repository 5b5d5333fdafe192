//! Raw HCI socket backend for Tilt scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.
//!
//! Tilt advertising reports have a fixed length and constant header bytes,
//! so packets are validated structurally before any field extraction.

use super::{EVENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::beacon::TiltEvent;
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use uuid::Uuid;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Total length of a Tilt advertising report: BLE header bytes + params.
const TILT_EVENT_LENGTH: usize = 45;

/// The first bytes of a Tilt advertising report are static: HCI event
/// packet, LE meta event, parameter length 42, advertising report sub-event.
/// They sanity-check incoming data before field extraction.
const TILT_HEADER: [u8; 4] = [HCI_EVENT_PKT, EVT_LE_META_EVENT, 0x2A, EVT_LE_ADVERTISING_REPORT];

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// LE Set Scan Enable command
#[repr(C, packed)]
struct LeSetScanEnableCmd {
    enable: u8,
    filter_dup: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // Raw Bluetooth HCI socket via libc; nix doesn't support BTPROTO_HCI.
    // SOCK_NONBLOCK is required for AsyncFd to work properly.
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Configure LE scanning parameters
fn configure_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    // Set scan parameters: passive scan, 10ms interval, 10ms window
    let params = LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: 0x0010, // 10ms in 0.625ms units
        window: 0x0010,   // 10ms in 0.625ms units
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };

    let params_bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const LeSetScanParametersCmd as *const u8,
            mem::size_of::<LeSetScanParametersCmd>(),
        )
    };

    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params_bytes);
    send_hci_command(fd, &packet)?;

    // Enable scanning
    let enable = LeSetScanEnableCmd {
        enable: 0x01,
        filter_dup: 0x00, // Don't filter duplicates
    };

    let enable_bytes = unsafe {
        std::slice::from_raw_parts(
            &enable as *const LeSetScanEnableCmd as *const u8,
            mem::size_of::<LeSetScanEnableCmd>(),
        )
    };

    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, enable_bytes);
    send_hci_command(fd, &packet)?;

    Ok(())
}

/// Parse a raw HCI packet as a Tilt advertising report.
///
/// Packets use the BLE iBeacon spec:
/// `{idx} [{value}] {description}`
///
/// ```text
/// 00 [04] HCI opcode (constant, 0x04 -> HCI event)
/// 01 [3E] LE event (constant)
/// 02 [2A] Parameter total length (constant, 42)
/// 03 [02] LE sub-event code (constant, 0x02 -> advertising report)
/// 04 [01] Number of reports (1)
/// 05 [03] Event type
/// 06 [01] Public address type
/// 07..13  MAC address (little-endian on the wire)
/// 13 [1E] Length of the data field
/// 14 [02] Header length (constant, 2)
/// 15 [01] Flag data type
/// 16 [04] LE flags
/// 17 [1A] Data length (constant, 26)
/// 18 [FF] Data type (manufacturer data)
/// 19 [4C] manufacturer ID - Apple iBeacon
/// 20 [00] manufacturer ID - Apple iBeacon
/// 21 [02] type (constant, defined by iBeacon spec)
/// 22 [15] length (constant, defined by iBeacon spec)
/// 23..39  device UUID
/// 39..41  major - temperature (degF)
/// 41..43  minor - specific gravity (scaled to integer)
/// 43 [??] TX power (dBm)
/// 44 [??] RSSI (dBm)
/// ```
///
/// Anything with a different length or header is not a Tilt report and
/// yields `None`, never an error.
pub fn read_packet(pkt: &[u8]) -> Option<TiltEvent> {
    if pkt.len() != TILT_EVENT_LENGTH || pkt[..4] != TILT_HEADER {
        return None;
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&pkt[7..13]);
    addr.reverse(); // present the wire's little-endian address big-endian

    let uuid = Uuid::from_slice(&pkt[23..39]).ok()?;

    Some(TiltEvent {
        mac: MacAddress(addr),
        uuid,
        major: u16::from_be_bytes([pkt[39], pkt[40]]),
        minor: u16::from_be_bytes([pkt[41], pkt[42]]),
        txpower: pkt[43] as i8,
        rssi: i16::from(pkt[44] as i8),
    })
}

/// Start scanning for Tilt devices using raw HCI sockets.
///
/// This function opens a raw HCI socket, configures LE scanning, and
/// processes advertising reports. Decoded events are sent through the
/// returned channel. Runs until the receiver is dropped.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan() -> Result<mpsc::Receiver<TiltEvent>, ScanError> {
    // Open and configure HCI socket for receiving events
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, 0)?; // Bind to hci0 to receive advertising events
    set_hci_filter(&fd)?;

    // We need a separate socket for sending commands (bound to specific device)
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, 0)?; // Bind to hci0
    configure_le_scan(&cmd_fd)?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    // Wrap in AsyncFd for async I/O
    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    // Spawn a task to read and process HCI events
    tokio::spawn(async move {
        let _cmd_fd = cmd_fd; // Keep command socket alive
        let mut buf = [0u8; 258]; // Max HCI event size

        loop {
            // Wait for the socket to be readable
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
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
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,  // EOF or empty read
                    Ok(Err(_)) => break, // Read error
                    Err(_) => break,     // WouldBlock - no more data
                };

                if let Some(event) = read_packet(&buf[..n])
                    && tx.send(event).await.is_err()
                {
                    // Receiver dropped, stop scanning
                    return;
                }
            }
        }
    });

    Ok(rx)
}
