//! Core broadcast loop for `tilt-listener`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit
//! codes so it can be tested deterministically with an injected scanner and
//! publisher.
//!
//! Each cycle: sleep for the adaptive interval, collect one scan window of
//! events (last advertisement per device wins), parse the batch, and publish
//! a presence message plus - for non-empty batches - one history message,
//! one retained state message per device, and a Spark patch per matching
//! sync rule.

use crate::beacon::{TiltColor, TiltEvent};
use crate::calibration::Calibrator;
use crate::devices::{DeviceRegistry, RegistryError};
use crate::message::{
    DeviceStatePayload, HistoryPayload, ServiceStatePayload, SparkPatchData, SparkPatchPayload,
    TiltMessage,
};
use crate::output::{OutboundMessage, Publisher, SPARK_PATCH_TOPIC, Topics};
use crate::output::mqtt::NameRequest;
use crate::parser::{DEFAULT_LOWER_BOUND, DEFAULT_UPPER_BOUND, EventDataParser};
use crate::scanner::{Backend, EventStage, ScanError};
use clap::Parser;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::warn;

/// Device identity file, relative to the config directory.
pub const DEVICES_FILE: &str = "devices.toml";
/// Temperature calibration file, relative to the config directory.
pub const TEMP_CAL_FILE: &str = "tempCal.csv";
/// Specific gravity calibration file, relative to the config directory.
pub const SG_CAL_FILE: &str = "SGCal.csv";

/// Rule type forwarded to the Spark patch topic.
const TEMP_SENSOR_EXTERNAL: &str = "TempSensorExternal";

/// Configuration for the broadcast loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Service name; used in topics and message keys.
    #[arg(long, default_value = "tilt")]
    pub name: String,

    /// MQTT broker host.
    #[arg(long, default_value = "eventbus")]
    pub mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Directory holding the device identity and calibration files.
    /// Missing files are created empty.
    #[arg(long, default_value = "/share")]
    pub config_dir: std::path::PathBuf,

    /// Lower bound of acceptable SG values.
    /// Out-of-bounds measurement values will be discarded.
    #[arg(long, default_value_t = DEFAULT_LOWER_BOUND)]
    pub lower_bound: f64,

    /// Upper bound of acceptable SG values.
    /// Out-of-bounds measurement values will be discarded.
    #[arg(long, default_value_t = DEFAULT_UPPER_BOUND)]
    pub upper_bound: f64,

    /// Seconds per scan window.
    #[arg(long, default_value_t = 5.0)]
    pub scan_duration: f64,

    /// Seconds between scans while no devices are detected.
    #[arg(long, default_value_t = 5.0)]
    pub inactive_scan_interval: f64,

    /// Seconds between scans while devices are detected.
    #[arg(long, default_value_t = 10.0)]
    pub active_scan_interval: f64,

    /// Start in simulation mode with one simulated device per listed
    /// color. This will not touch Bluetooth hardware.
    #[arg(long, value_parser = parse_color)]
    pub simulate: Vec<TiltColor>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output (debug-level logging)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Value parser for `--simulate`.
pub fn parse_color(src: &str) -> Result<TiltColor, String> {
    src.parse()
}

/// Errors returned by the broadcast loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without
/// Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        simulate: Vec<TiltColor>,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<TiltEvent>, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        simulate: Vec<TiltColor>,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<TiltEvent>, ScanError>> + Send + '_>>
    {
        Box::pin(async move { crate::scanner::start_scan(backend, &simulate).await })
    }
}

/// Load the identity registry and calibration tables from the configured
/// directory and assemble the parser.
pub fn build_parser(options: &Options) -> Result<EventDataParser, RunError> {
    let registry = DeviceRegistry::load(options.config_dir.join(DEVICES_FILE))?;
    let temp_cal = Calibrator::new(options.config_dir.join(TEMP_CAL_FILE))?;
    let sg_cal = Calibrator::new(options.config_dir.join(SG_CAL_FILE))?;
    Ok(EventDataParser::new(
        registry,
        temp_cal,
        sg_cal,
        options.lower_bound,
        options.upper_bound,
    ))
}

fn time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn encode<T: Serialize>(payload: &T) -> Option<String> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to encode payload: {}", e);
            None
        }
    }
}

/// Collect one scan window of events from the stream, keeping only the most
/// recent advertisement per device. Returns the staged batch and whether
/// the stream has ended.
async fn collect_window(
    events: &mut mpsc::Receiver<TiltEvent>,
    duration: Duration,
) -> (Vec<TiltEvent>, bool) {
    let mut stage = EventStage::new();
    let deadline = tokio::time::Instant::now() + duration;

    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => stage.insert(event),
            Ok(None) => return (stage.drain(), true),
            Err(_) => return (stage.drain(), false),
        }
    }
}

/// The periodic scan-and-publish loop.
pub struct Broadcaster {
    options: Options,
    parser: EventDataParser,
    topics: Topics,
    scan_duration: Duration,
    inactive_interval: Duration,
    active_interval: Duration,
    scan_interval: Duration,
    prev_num_messages: usize,
}

impl Broadcaster {
    pub fn new(options: Options, parser: EventDataParser) -> Broadcaster {
        let topics = Topics::new(&options.name);
        // A scan window below one second would never catch the ~1 Hz Tilt
        // advertisements; negative intervals make no sense.
        let scan_duration = Duration::from_secs_f64(options.scan_duration.max(1.0));
        let inactive_interval = Duration::from_secs_f64(options.inactive_scan_interval.max(0.0));
        let active_interval = Duration::from_secs_f64(options.active_scan_interval.max(0.0));

        Broadcaster {
            options,
            parser,
            topics,
            scan_duration,
            inactive_interval,
            active_interval,
            scan_interval: Duration::from_secs(1),
            prev_num_messages: 0,
        }
    }

    /// Run until the event stream ends (never, for the radio backends).
    ///
    /// Rename requests arriving on `renames` are applied between batches,
    /// never mid-parse.
    pub async fn run(
        &mut self,
        scanner: &dyn Scanner,
        publisher: &dyn Publisher,
        renames: &mut mpsc::Receiver<NameRequest>,
    ) -> Result<(), RunError> {
        let backend = if self.options.simulate.is_empty() {
            self.options.backend
        } else {
            Backend::Sim
        };
        let mut events = scanner
            .start_scan(backend, self.options.simulate.clone())
            .await?;

        loop {
            tokio::time::sleep(self.scan_interval).await;

            let (batch, closed) = collect_window(&mut events, self.scan_duration).await;
            self.drain_renames(renames)?;

            let messages = self.parser.parse(&batch)?;
            self.adapt_interval(messages.len());
            self.publish_cycle(publisher, &messages).await;

            if closed {
                return Ok(());
            }
        }
    }

    fn drain_renames(&mut self, renames: &mut mpsc::Receiver<NameRequest>) -> Result<(), RunError> {
        while let Ok(request) = renames.try_recv() {
            self.parser.apply_custom_names(&request)?;
        }
        Ok(())
    }

    /// Scan more eagerly while devices are disappearing or absent, and lazily
    /// while the fleet is stable.
    fn adapt_interval(&mut self, curr_num_messages: usize) {
        let prev_num_messages = self.prev_num_messages;
        self.prev_num_messages = curr_num_messages;

        self.scan_interval = if curr_num_messages == 0 || curr_num_messages < prev_num_messages {
            self.inactive_interval
        } else {
            self.active_interval
        };
    }

    async fn send(&self, publisher: &dyn Publisher, topic: String, payload: String, retain: bool) {
        let message = OutboundMessage {
            topic,
            payload,
            retain,
        };
        if let Err(e) = publisher.publish(message).await {
            warn!("Failed to publish: {}", e);
        }
    }

    async fn publish_cycle(&self, publisher: &dyn Publisher, messages: &[TiltMessage]) {
        // Always broadcast a presence message. This makes the service show
        // up in the UI even without active Tilts.
        if let Some(payload) = encode(&ServiceStatePayload {
            key: self.options.name.clone(),
            kind: "Tilt.state.service",
            timestamp: time_ms(),
        }) {
            self.send(publisher, self.topics.state.clone(), payload, true)
                .await;
        }

        if messages.is_empty() {
            return;
        }

        // Publish history. Devices sharing a display name share an entry.
        let history = HistoryPayload {
            key: self.options.name.clone(),
            data: messages
                .iter()
                .map(|msg| (msg.name.clone(), msg.data.clone()))
                .collect(),
        };
        if let Some(payload) = encode(&history) {
            self.send(publisher, self.topics.history.clone(), payload, false)
                .await;
        }

        // Publish state per device, retained, so the last value survives
        // when a device stops broadcasting.
        let timestamp = time_ms();
        for msg in messages {
            let state = DeviceStatePayload {
                key: self.options.name.clone(),
                kind: "Tilt.state",
                timestamp,
                color: msg.color.to_string(),
                mac: msg.mac.clone(),
                name: msg.name.clone(),
                data: msg.data.clone(),
            };
            if let Some(payload) = encode(&state) {
                let topic = format!("{}/{}/{}", self.topics.state, msg.color, msg.mac);
                self.send(publisher, topic, payload, true).await;
            }

            for rule in &msg.sync {
                if rule.kind != TEMP_SENSOR_EXTERNAL {
                    continue;
                }
                let Some(temp_c) = msg.data.get("temperature[degC]") else {
                    continue;
                };
                let patch = SparkPatchPayload {
                    id: rule.block.clone(),
                    service_id: rule.service.clone(),
                    kind: TEMP_SENSOR_EXTERNAL,
                    data: SparkPatchData {
                        setting_deg_c: *temp_c,
                    },
                };
                if let Some(payload) = encode(&patch) {
                    self.send(publisher, SPARK_PATCH_TOPIC.to_string(), payload, false)
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::MacAddress;
    use crate::test_utils::tilt_event;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PURPLE_MAC: MacAddress = MacAddress([0xBB, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);
    const BLACK_MAC: MacAddress = MacAddress([0xDD, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);

    #[derive(Debug)]
    struct FakeScanner {
        events: Mutex<Vec<TiltEvent>>,
    }

    impl FakeScanner {
        fn new(events: Vec<TiltEvent>) -> Self {
            Self {
                events: Mutex::new(events),
            }
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan(
            &self,
            _backend: Backend,
            _simulate: Vec<TiltColor>,
        ) -> Pin<
            Box<dyn Future<Output = Result<mpsc::Receiver<TiltEvent>, ScanError>> + Send + '_>,
        > {
            let events = self.events.lock().unwrap().clone();
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    let _ = tx.send(event).await;
                }
                // tx drops here, closing the stream after one window
                Ok(rx)
            })
        }
    }

    #[derive(Debug, Default)]
    struct FakePublisher {
        messages: Mutex<Vec<OutboundMessage>>,
    }

    impl FakePublisher {
        fn collected(&self) -> Vec<OutboundMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Publisher for FakePublisher {
        fn publish(
            &self,
            message: OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), crate::output::PublishError>> + Send + '_>>
        {
            self.messages.lock().unwrap().push(message);
            Box::pin(async { Ok(()) })
        }
    }

    fn options(dir: &TempDir) -> Options {
        Options {
            name: "tilt".to_string(),
            mqtt_host: "eventbus".to_string(),
            mqtt_port: 1883,
            config_dir: dir.path().to_path_buf(),
            lower_bound: DEFAULT_LOWER_BOUND,
            upper_bound: DEFAULT_UPPER_BOUND,
            scan_duration: 1.0,
            inactive_scan_interval: 5.0,
            active_scan_interval: 10.0,
            simulate: vec![],
            backend: Backend::default(),
            verbose: false,
        }
    }

    fn broadcaster(dir: &TempDir) -> Broadcaster {
        let options = options(dir);
        let parser = build_parser(&options).unwrap();
        Broadcaster::new(options, parser)
    }

    async fn run_once(
        broadcaster: &mut Broadcaster,
        scanner: &FakeScanner,
        publisher: &FakePublisher,
    ) {
        let (_tx, mut renames) = mpsc::channel(1);
        broadcaster
            .run(scanner, publisher, &mut renames)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_presence_history_and_state() {
        let dir = TempDir::new().unwrap();
        let mut broadcaster = broadcaster(&dir);

        let scanner = FakeScanner::new(vec![
            tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002),
            tilt_event(BLACK_MAC, TiltColor::Black.uuid(), 70, 1040),
        ]);
        let publisher = FakePublisher::default();
        run_once(&mut broadcaster, &scanner, &publisher).await;

        let messages = publisher.collected();
        assert_eq!(messages.len(), 4);

        // Presence, retained
        assert_eq!(messages[0].topic, "brewcast/state/tilt");
        assert!(messages[0].retain);
        assert!(messages[0].payload.contains("Tilt.state.service"));

        // History with both devices under their auto-assigned names
        assert_eq!(messages[1].topic, "brewcast/history/tilt");
        assert!(!messages[1].retain);
        let history: serde_json::Value = serde_json::from_str(&messages[1].payload).unwrap();
        assert_eq!(history["key"], "tilt");
        assert!(history["data"]["Purple"]["specificGravity"].is_number());
        assert!(history["data"]["Black"]["specificGravity"].is_number());

        // Per-device state, retained; staging drains in address order
        assert_eq!(messages[2].topic, "brewcast/state/tilt/Purple/BB7F97FC141E");
        assert!(messages[2].retain);
        let state: serde_json::Value = serde_json::from_str(&messages[2].payload).unwrap();
        assert_eq!(state["type"], "Tilt.state");
        assert_eq!(state["name"], "Purple");
        assert_eq!(state["data"]["rssi[dBm]"], -80);

        assert_eq!(messages[3].topic, "brewcast/state/tilt/Black/DD7F97FC141E");
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_presence_for_empty_batches() {
        let dir = TempDir::new().unwrap();
        let mut broadcaster = broadcaster(&dir);

        let scanner = FakeScanner::new(vec![]);
        let publisher = FakePublisher::default();
        run_once(&mut broadcaster, &scanner, &publisher).await;

        let messages = publisher.collected();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "brewcast/state/tilt");
        assert!(messages[0].payload.contains("Tilt.state.service"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_spark_patches_for_sync_rules() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(DEVICES_FILE),
            r#"[names]
DD7F97FC141E = "Black"

[[sync]]
type = "TempSensorExternal"
tilt = "Black"
service = "spark-one"
block = "Fridge Sensor"
"#,
        )
        .unwrap();
        let mut broadcaster = broadcaster(&dir);

        let scanner = FakeScanner::new(vec![tilt_event(
            BLACK_MAC,
            TiltColor::Black.uuid(),
            68,
            1002,
        )]);
        let publisher = FakePublisher::default();
        run_once(&mut broadcaster, &scanner, &publisher).await;

        let messages = publisher.collected();
        assert_eq!(messages.len(), 4);

        let patch = &messages[3];
        assert_eq!(patch.topic, SPARK_PATCH_TOPIC);
        assert!(!patch.retain);
        let payload: serde_json::Value = serde_json::from_str(&patch.payload).unwrap();
        assert_eq!(payload["id"], "Fridge Sensor");
        assert_eq!(payload["serviceId"], "spark-one");
        assert_eq!(payload["type"], "TempSensorExternal");
        // No calibration data: the raw converted temperature is forwarded
        assert_eq!(payload["data"]["setting[degC]"], 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_renames_before_parsing() {
        let dir = TempDir::new().unwrap();
        let mut broadcaster = broadcaster(&dir);

        let scanner = FakeScanner::new(vec![tilt_event(
            PURPLE_MAC,
            TiltColor::Purple.uuid(),
            68,
            1002,
        )]);
        let publisher = FakePublisher::default();

        let (tx, mut renames) = mpsc::channel(4);
        tx.send(BTreeMap::from([(
            "BB7F97FC141E".to_string(),
            "Fermenter (loft)".to_string(),
        )]))
        .await
        .unwrap();

        broadcaster
            .run(&scanner, &publisher, &mut renames)
            .await
            .unwrap();

        let messages = publisher.collected();
        let history: serde_json::Value = serde_json::from_str(&messages[1].payload).unwrap();
        assert!(history["data"]["Fermenter (loft)"].is_object());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stages_last_advertisement_per_device() {
        let dir = TempDir::new().unwrap();
        let mut broadcaster = broadcaster(&dir);

        let scanner = FakeScanner::new(vec![
            tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002),
            tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 69, 1010),
        ]);
        let publisher = FakePublisher::default();
        run_once(&mut broadcaster, &scanner, &publisher).await;

        let messages = publisher.collected();
        // presence + history + one device state
        assert_eq!(messages.len(), 3);
        let state: serde_json::Value = serde_json::from_str(&messages[2].payload).unwrap();
        assert_eq!(state["data"]["specificGravity"], 1.01);
        assert_eq!(state["data"]["temperature[degF]"], 69.0);
    }

    #[test]
    fn adapt_interval_follows_device_count() {
        let dir = TempDir::new().unwrap();
        let mut broadcaster = broadcaster(&dir);

        // No devices: inactive interval
        broadcaster.adapt_interval(0);
        assert_eq!(broadcaster.scan_interval, broadcaster.inactive_interval);

        // Devices detected: active interval
        broadcaster.adapt_interval(2);
        assert_eq!(broadcaster.scan_interval, broadcaster.active_interval);

        // Shrinking fleet: back to eager scanning
        broadcaster.adapt_interval(1);
        assert_eq!(broadcaster.scan_interval, broadcaster.inactive_interval);

        // Stable fleet
        broadcaster.adapt_interval(1);
        assert_eq!(broadcaster.scan_interval, broadcaster.active_interval);
    }

    #[test]
    fn scan_duration_is_clamped() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir);
        opts.scan_duration = 0.1;
        let parser = build_parser(&opts).unwrap();
        let broadcaster = Broadcaster::new(opts, parser);
        assert_eq!(broadcaster.scan_duration, Duration::from_secs(1));
    }
}
