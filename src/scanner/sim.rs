//! Simulated scanner backend.
//!
//! Emits plausible random-walk readings under the same `TiltEvent` contract
//! as the radio backends, so the whole pipeline can run without Bluetooth
//! hardware. One simulated device per configured color.

use super::{EVENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::beacon::{TiltColor, TiltEvent};
use crate::mac_address::MacAddress;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use tokio::sync::mpsc;

/// Interval between simulated advertisement rounds.
const SIM_INTERVAL: Duration = Duration::from_secs(1);

/// Random-walk state for one simulated device.
#[derive(Debug)]
pub struct Simulation {
    color: TiltColor,
    mac: MacAddress,
    temp_f: f64,
    raw_sg: f64,
    rssi: f64,
}

impl Simulation {
    /// Create a simulated device for a color. The address is derived from
    /// the family UUID, so it never collides with a real device address.
    pub fn new(color: TiltColor) -> Simulation {
        let uuid_bytes = color.uuid().into_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&uuid_bytes[..6]);

        Simulation {
            color,
            mac: MacAddress(addr),
            temp_f: 68.0,
            raw_sg: 1050.0,
            rssi: -80.0,
        }
    }

    /// Advance the walk and produce the next advertisement.
    pub fn update(&mut self, rng: &mut impl Rng) -> TiltEvent {
        self.temp_f += rng.gen_range(-2.0..=2.0);
        self.raw_sg += rng.gen_range(-10.0..=10.0);
        self.rssi += rng.gen_range(-1.0..=1.0);

        TiltEvent {
            mac: self.mac,
            uuid: self.color.uuid(),
            major: self.temp_f.round() as u16,
            minor: self.raw_sg.round() as u16,
            txpower: 0,
            rssi: self.rssi.round() as i16,
        }
    }
}

/// Start the simulated backend with one device per color.
///
/// Events are emitted once per second per device until the receiver is
/// dropped. An empty color list yields an empty, open stream.
pub fn start_scan(simulate: &[TiltColor]) -> Result<mpsc::Receiver<TiltEvent>, ScanError> {
    let mut simulations: Vec<Simulation> = simulate.iter().map(|c| Simulation::new(*c)).collect();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        loop {
            tokio::time::sleep(SIM_INTERVAL).await;
            for sim in &mut simulations {
                if tx.send(sim.update(&mut rng)).await.is_err() {
                    return; // Receiver dropped, stop simulating
                }
            }
        }
    });

    Ok(rx)
}
