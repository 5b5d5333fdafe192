//! BlueZ D-Bus backend for Tilt scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{EVENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::beacon::{
    APPLE_MANUFACTURER_ID, APPLE_MANUFACTURER_ID_BYTES, TiltColor, TiltEvent,
    decode_manufacturer_data,
};
use crate::mac_address::MacAddress;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start scanning for Tilt devices using the BlueZ D-Bus backend.
///
/// This function initializes the Bluetooth adapter and starts a passive scan
/// filtered on the Apple manufacturer id. Decoded events are sent through
/// the returned channel. Runs until the receiver is dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<TiltEvent>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    // Filter on the Apple manufacturer id; the iBeacon framing and the
    // Tilt UUID table narrow it down after decode
    let pattern = Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: APPLE_MANUFACTURER_ID_BYTES.to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        // Keep all Bluetooth state alive by moving it into this task
        let _session = session;
        let _monitor_manager = monitor_manager;

        while let Some(event) = monitor_handle.next().await {
            if let MonitorEvent::DeviceFound(device_id) = event
                && let Err(e) = process_device(&adapter, device_id.device, &tx).await
            {
                debug!("Failed to process device: {}", e);
            }
        }
    });

    Ok(rx)
}

/// Process a discovered Bluetooth device and extract a Tilt event.
///
/// Reads the Apple manufacturer data from the device and decodes it as a
/// Tilt iBeacon. Advertisements from unrelated Apple devices are dropped
/// here by the UUID table.
async fn process_device(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<TiltEvent>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let mac: MacAddress = address.into();

    let manufacturer_data = match device.manufacturer_data().await? {
        Some(data) => data,
        None => return Ok(()), // No manufacturer data available
    };

    let apple_data = match manufacturer_data.get(&APPLE_MANUFACTURER_ID) {
        Some(data) => data,
        None => return Ok(()), // Not an iBeacon device
    };

    let rssi = device.rssi().await?.unwrap_or_default();

    let Some(event) = decode_manufacturer_data(mac, rssi, apple_data) else {
        return Ok(()); // Not an iBeacon
    };

    if TiltColor::from_uuid(&event.uuid).is_none() {
        debug!("Ignoring iBeacon with unknown UUID {} from {}", event.uuid, mac);
        return Ok(());
    }

    debug!(
        "Recv mac={} uuid={} major={} minor={}",
        mac, event.uuid, event.major, event.minor
    );
    let _ = tx.send(event).await;

    Ok(())
}
