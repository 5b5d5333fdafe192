//! Output message types for parsed Tilt readings.
//!
//! `TiltMessage` is the per-device result of one parse batch. The payload
//! structs define the exact JSON shapes published to the eventbus.

use crate::beacon::TiltColor;
use serde::Serialize;
use std::collections::BTreeMap;

/// A single measurement value. Untagged so RSSI serializes as an integer
/// while temperatures and gravities stay floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Int(v) => *v as f64,
            FieldValue::Float(v) => *v,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

/// Measurement-key to value mapping published for one device.
pub type DataMap = BTreeMap<String, FieldValue>;

/// A directive to forward a device's temperature reading into another
/// service's control block. Stored in the device config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRule {
    /// Rule type; only `TempSensorExternal` is published.
    pub kind: String,
    /// Source device display name.
    pub tilt: String,
    /// Target service id.
    pub service: String,
    /// Target block id within the service.
    pub block: String,
}

/// Final output for one device in one parse batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TiltMessage {
    /// Resolved display name.
    pub name: String,
    /// Normalized device address.
    pub mac: String,
    /// Device family.
    pub color: TiltColor,
    /// Calibrated and raw measurement values.
    pub data: DataMap,
    /// Sync rules whose source name matches `name`.
    pub sync: Vec<SyncRule>,
}

/// Service presence message, published retained on every cycle so the
/// service shows up in the UI even without active Tilts.
#[derive(Debug, Serialize)]
pub struct ServiceStatePayload {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: u64,
}

/// History message: one per non-empty batch, mapping display name to data.
/// Devices sharing a display name share an entry (last one wins).
#[derive(Debug, Serialize)]
pub struct HistoryPayload {
    pub key: String,
    pub data: BTreeMap<String, DataMap>,
}

/// Per-device state message, published retained so the last value survives
/// for newly-connecting consumers.
#[derive(Debug, Serialize)]
pub struct DeviceStatePayload {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: u64,
    pub color: String,
    pub mac: String,
    pub name: String,
    pub data: DataMap,
}

/// Patch message forwarding a temperature reading to a Spark block.
#[derive(Debug, Serialize)]
pub struct SparkPatchPayload {
    pub id: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: SparkPatchData,
}

#[derive(Debug, Serialize)]
pub struct SparkPatchData {
    #[serde(rename = "setting[degC]")]
    pub setting_deg_c: FieldValue,
}
