//! `tilt-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The core business logic lives in [`crate::app`]
//! and [`crate::parser`] where it can be tested deterministically with
//! injected scanner and publisher implementations.

pub mod app;
pub mod beacon;
pub mod calibration;
pub mod devices;
pub mod mac_address;
pub mod message;
pub mod output;
pub mod parser;
pub mod scanner;
pub mod units;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use beacon::{TiltColor, TiltEvent, TiltModel, decode_manufacturer_data};
pub use calibration::Calibrator;
pub use devices::{DeviceRegistry, RegistryError};
pub use mac_address::MacAddress;
pub use message::{FieldValue, TiltMessage};
pub use output::{OutboundMessage, Publisher};
pub use parser::EventDataParser;
pub use scanner::{Backend, EventStage, ScanError};
