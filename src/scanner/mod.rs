//! BLE scanner abstraction for Tilt devices.
//!
//! This module provides backends that stream decoded `TiltEvent`s over a
//! channel, and the per-address staging used to batch one event per device
//! per scan window.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

pub mod sim;

use crate::beacon::{TiltColor, TiltEvent};
use crate::mac_address::MacAddress;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Channel buffer size for decoded events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
    /// Simulated devices (no radio access)
    Sim,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        return Backend::Sim;
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            Backend::Sim => write!(f, "sim"),
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
            "sim" | "simulate" => Ok(Backend::Sim),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Per-address staging for one scan window.
///
/// Multiple advertisements for the same address within a window overwrite
/// each other; only the most recent survives (last-write-wins). Draining
/// yields events in address order.
#[derive(Debug, Default)]
pub struct EventStage {
    events: BTreeMap<MacAddress, TiltEvent>,
}

impl EventStage {
    pub fn new() -> EventStage {
        EventStage::default()
    }

    pub fn insert(&mut self, event: TiltEvent) {
        self.events.insert(event.mac, event);
    }

    pub fn drain(&mut self) -> Vec<TiltEvent> {
        let events = std::mem::take(&mut self.events);
        events.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Start scanning for Tilt devices using the specified backend.
///
/// Returns a receiver of decoded events. The stream runs until the receiver
/// is dropped; structurally invalid or non-Tilt advertisements are dropped
/// at the backend.
pub async fn start_scan(
    backend: Backend,
    simulate: &[TiltColor],
) -> Result<mpsc::Receiver<TiltEvent>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
        Backend::Sim => sim::start_scan(simulate),
    }
}
