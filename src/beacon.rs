//! Tilt iBeacon decoding.
//!
//! Tilt hydrometers broadcast iBeacon-style advertisements under the Apple
//! manufacturer id. The 128-bit beacon UUID selects the device family
//! (color), `major` carries the raw temperature and `minor` the raw specific
//! gravity. This module is pure decoding: structural mismatches yield
//! "no event", never an error.

use crate::mac_address::MacAddress;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Apple manufacturer id used by iBeacon advertisements.
pub const APPLE_MANUFACTURER_ID: u16 = 0x004C;

/// Apple manufacturer id as little-endian bytes, for advertisement filtering.
pub const APPLE_MANUFACTURER_ID_BYTES: [u8; 2] = [0x4C, 0x00];

/// iBeacon manufacturer-data layout:
/// 2 framing bytes + 16 UUID bytes + 2 major + 2 minor + 1 tx power.
const BEACON_DATA_LENGTH: usize = 25;

/// Constant framing bytes at the start of an iBeacon payload
/// (type and length, defined by the iBeacon spec).
const BEACON_TYPE_LENGTH: [u8; 2] = [0x02, 0x15];

/// A decoded Tilt advertisement. Ephemeral: created per scan cycle,
/// discarded after parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltEvent {
    /// Device hardware address, from the link-layer advertisement.
    pub mac: MacAddress,
    /// Beacon UUID identifying the device family.
    pub uuid: Uuid,
    /// Raw 16-bit field encoding temperature (degF).
    pub major: u16,
    /// Raw 16-bit field encoding specific gravity (scaled to integer).
    pub minor: u16,
    /// Transmit power in dBm, from the manufacturer payload.
    pub txpower: i8,
    /// Received signal strength in dBm, from the link-layer advertisement.
    pub rssi: i16,
}

/// The eight known Tilt device families, identified by beacon UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TiltColor {
    Red,
    Green,
    Black,
    Purple,
    Orange,
    Blue,
    Yellow,
    Pink,
}

const TILT_COLORS: [(TiltColor, Uuid); 8] = [
    (TiltColor::Red, Uuid::from_u128(0xa495bb10_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Green, Uuid::from_u128(0xa495bb20_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Black, Uuid::from_u128(0xa495bb30_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Purple, Uuid::from_u128(0xa495bb40_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Orange, Uuid::from_u128(0xa495bb50_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Blue, Uuid::from_u128(0xa495bb60_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Yellow, Uuid::from_u128(0xa495bb70_c5b1_4b44_b512_1370f02d74de)),
    (TiltColor::Pink, Uuid::from_u128(0xa495bb80_c5b1_4b44_b512_1370f02d74de)),
];

impl TiltColor {
    /// Look up the device family for a beacon UUID.
    /// Unknown UUIDs are not Tilt devices.
    pub fn from_uuid(uuid: &Uuid) -> Option<TiltColor> {
        TILT_COLORS
            .iter()
            .find(|(_, u)| u == uuid)
            .map(|(color, _)| *color)
    }

    /// The beacon UUID broadcast by this device family.
    pub fn uuid(&self) -> Uuid {
        TILT_COLORS
            .iter()
            .find(|(color, _)| color == self)
            .map(|(_, u)| *u)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TiltColor::Red => "Red",
            TiltColor::Green => "Green",
            TiltColor::Black => "Black",
            TiltColor::Purple => "Purple",
            TiltColor::Orange => "Orange",
            TiltColor::Blue => "Blue",
            TiltColor::Yellow => "Yellow",
            TiltColor::Pink => "Pink",
        }
    }
}

impl fmt::Display for TiltColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TiltColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "red" => Ok(TiltColor::Red),
            "green" => Ok(TiltColor::Green),
            "black" => Ok(TiltColor::Black),
            "purple" => Ok(TiltColor::Purple),
            "orange" => Ok(TiltColor::Orange),
            "blue" => Ok(TiltColor::Blue),
            "yellow" => Ok(TiltColor::Yellow),
            "pink" => Ok(TiltColor::Pink),
            _ => Err(format!("unknown Tilt color: {}", s)),
        }
    }
}

/// Device model, inferred from the raw gravity field.
///
/// The Tilt Pro broadcasts one extra decimal digit for both temperature and
/// gravity. There is no protocol field for this: a raw `minor` above 5000
/// cannot be a plausible standard-resolution gravity, so it implies Pro.
/// This is a heuristic, not a protocol guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltModel {
    Standard,
    Pro,
}

impl TiltModel {
    /// Infer the model from the raw `minor` (gravity) field.
    pub fn detect(raw_minor: u16) -> TiltModel {
        if raw_minor > 5000 {
            TiltModel::Pro
        } else {
            TiltModel::Standard
        }
    }

    /// Scale the raw `minor` field to a specific gravity.
    pub fn decode_sg(&self, raw_minor: u16) -> f64 {
        match self {
            TiltModel::Standard => f64::from(raw_minor) / 1000.0,
            TiltModel::Pro => f64::from(raw_minor) / 10000.0,
        }
    }

    /// Scale the raw `major` field to a Fahrenheit temperature.
    pub fn decode_temp_f(&self, raw_major: u16) -> f64 {
        match self {
            TiltModel::Standard => f64::from(raw_major),
            TiltModel::Pro => f64::from(raw_major) / 10.0,
        }
    }

    /// Rounding digits for calibrated temperatures.
    pub fn temp_digits(&self) -> i32 {
        match self {
            TiltModel::Standard => 0,
            TiltModel::Pro => 1,
        }
    }

    /// Rounding digits for calibrated gravity.
    pub fn sg_digits(&self) -> i32 {
        match self {
            TiltModel::Standard => 3,
            TiltModel::Pro => 4,
        }
    }
}

/// Decode an Apple manufacturer-data payload as a Tilt iBeacon.
///
/// `data` is the manufacturer-specific payload without the company id
/// prefix. The signal strength comes from the link-layer advertisement, not
/// from the payload. Returns `None` when the payload is not an iBeacon
/// (wrong framing bytes or length) - that simply means the advertisement is
/// not from a Tilt.
pub fn decode_manufacturer_data(mac: MacAddress, rssi: i16, data: &[u8]) -> Option<TiltEvent> {
    if data.len() != BEACON_DATA_LENGTH || data[..2] != BEACON_TYPE_LENGTH {
        return None;
    }

    let uuid = Uuid::from_slice(&data[2..18]).ok()?;
    let major = u16::from_be_bytes([data[18], data[19]]);
    let minor = u16::from_be_bytes([data[20], data[21]]);
    let txpower = data[22] as i8;

    Some(TiltEvent {
        mac,
        uuid,
        major,
        minor,
        txpower,
        rssi,
    })
}
