//! Shared fixtures for unit tests.

use crate::beacon::TiltEvent;
use crate::mac_address::MacAddress;
use uuid::Uuid;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xDD, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);

/// The Purple family beacon UUID.
pub const PURPLE_UUID: Uuid = Uuid::from_u128(0xa495bb40_c5b1_4b44_b512_1370f02d74de);

/// Canonical SG calibration table: four valid Black rows, two malformed
/// ones, and a quoted name key.
pub const SG_CAL_CONTENT: &str = r#"Black, 1.000, 2.001
Black, 1.001, 2.002
Black, 1.002, 2.003
BLACK, 1.003, 2.004
Black, 1, Many
Black, Few, 2.005
"Ferment 1 red", 1.000, 3.010
"Ferment 1 red", 1.001, 3.011
"Ferment 1 red", 1.002, 3.012
"Ferment 1 red", 1.003, 3.013
"Ferment 1 red", 1.004, 3.014
"#;

/// Canonical temperature calibration table for Black.
pub const TEMP_CAL_CONTENT: &str = "\
Black, 39,40
Black, 46,48
Black, 54,55
Black, 60,62
Black, 68,70
Black, 76,76
";

/// Build an Apple manufacturer-data payload in iBeacon layout.
pub fn beacon_payload(uuid: &Uuid, major: u16, minor: u16, txpower: i8) -> Vec<u8> {
    let mut data = vec![0x02, 0x15];
    data.extend_from_slice(uuid.as_bytes());
    data.extend_from_slice(&major.to_be_bytes());
    data.extend_from_slice(&minor.to_be_bytes());
    data.push(txpower as u8);
    // iBeacon manufacturer payload is 25 bytes (BEACON_DATA_LENGTH); the two
    // trailing bytes after tx power are unused by the decoder.
    data.extend_from_slice(&[0x00, 0x00]);
    data
}

/// Build a `TiltEvent` with the fields tests care about.
pub fn tilt_event(mac: MacAddress, uuid: Uuid, major: u16, minor: u16) -> TiltEvent {
    TiltEvent {
        mac,
        uuid,
        major,
        minor,
        txpower: 0,
        rssi: -80,
    }
}
