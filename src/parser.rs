//! The event decoding and calibration pipeline.
//!
//! `EventDataParser` turns a batch of raw `TiltEvent`s into `TiltMessage`s:
//! decode the raw fields, reject implausible readings, resolve device
//! identity, apply calibration, derive unit conversions, and assemble the
//! output data map. Invalid events are dropped, not replaced; the identity
//! store is committed once per batch.
//!
//! The parser owns no I/O of its own beyond the injected registry and
//! calibration tables, and must not be invoked concurrently: it mutates the
//! shared identity store.

use crate::beacon::{TiltColor, TiltEvent, TiltModel};
use crate::calibration::Calibrator;
use crate::devices::{DeviceRegistry, RegistryError};
use crate::message::{DataMap, FieldValue, TiltMessage};
use crate::units::{deg_f_to_c, sg_to_plato};
use std::collections::BTreeMap;
use tracing::warn;

/// Default inclusive window of plausible specific gravity readings.
/// Garbled radio payloads can decode to wildly impossible values.
pub const DEFAULT_LOWER_BOUND: f64 = 0.5;
pub const DEFAULT_UPPER_BOUND: f64 = 2.0;

/// Raw physical values extracted from one event.
struct DecodedReading {
    color: TiltColor,
    temp_f: f64,
    sg: f64,
    model: TiltModel,
}

/// Batch parser over the shared identity registry and calibration tables.
pub struct EventDataParser {
    registry: DeviceRegistry,
    temp_cal: Calibrator,
    sg_cal: Calibrator,
    lower_bound: f64,
    upper_bound: f64,
}

impl EventDataParser {
    /// Build a parser from explicitly constructed collaborators.
    ///
    /// The registry and calibrators are process-lifetime singletons with a
    /// single writer; the caller must serialize `parse` invocations.
    pub fn new(
        registry: DeviceRegistry,
        temp_cal: Calibrator,
        sg_cal: Calibrator,
        lower_bound: f64,
        upper_bound: f64,
    ) -> EventDataParser {
        EventDataParser {
            registry,
            temp_cal,
            sg_cal,
            lower_bound,
            upper_bound,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Extract raw temperature and SG values from one event.
    ///
    /// Returns `None` for events that are not valid Tilt readings: unknown
    /// beacon UUIDs and out-of-bounds gravity values.
    fn decode_event_data(&self, event: &TiltEvent) -> Option<DecodedReading> {
        let color = TiltColor::from_uuid(&event.uuid)?;

        let model = TiltModel::detect(event.minor);
        let sg = model.decode_sg(event.minor);
        let temp_f = model.decode_temp_f(event.major);

        if sg < self.lower_bound || sg > self.upper_bound {
            warn!(
                "Discarding Tilt event for {}/{}. SG={} bounds=[{}, {}]",
                color, event.mac, sg, self.lower_bound, self.upper_bound
            );
            return None;
        }

        Some(DecodedReading {
            color,
            temp_f,
            sg,
            model,
        })
    }

    /// Parse a single event into a message.
    ///
    /// `Ok(None)` means the event was invalid and is dropped. Registry
    /// errors are structural bugs and propagate.
    fn parse_event(&mut self, event: &TiltEvent) -> Result<Option<TiltMessage>, RegistryError> {
        let Some(decoded) = self.decode_event_data(event) else {
            return Ok(None);
        };

        let mac = event.mac.normalized();
        let name = self.registry.lookup(&mac, decoded.color.as_str())?;

        let raw_temp_f = decoded.temp_f;
        let raw_temp_c = deg_f_to_c(raw_temp_f);

        let temp_digits = decoded.model.temp_digits();
        let sg_digits = decoded.model.sg_digits();

        let candidates = [mac.as_str(), name.as_str()];
        let cal_temp_f = self
            .temp_cal
            .calibrated_value(&candidates, raw_temp_f, temp_digits);
        let cal_temp_c = cal_temp_f.map(deg_f_to_c);

        let raw_sg = decoded.sg;
        let cal_sg = self.sg_cal.calibrated_value(&candidates, raw_sg, sg_digits);

        let raw_plato = sg_to_plato(raw_sg);
        let cal_plato = cal_sg.map(sg_to_plato);

        let mut data = DataMap::new();
        data.insert("temperature[degF]".to_string(), FieldValue::Float(raw_temp_f));
        data.insert("temperature[degC]".to_string(), FieldValue::Float(raw_temp_c));
        data.insert("specificGravity".to_string(), FieldValue::Float(raw_sg));
        data.insert("plato[degP]".to_string(), FieldValue::Float(raw_plato));
        data.insert("rssi[dBm]".to_string(), FieldValue::Int(i64::from(event.rssi)));

        // If calibrated values are present, they become the default.
        // Uncalibrated values are only present if calibrated values are too.
        if let Some(v) = cal_temp_f {
            data.insert("temperature[degF]".to_string(), FieldValue::Float(v));
            data.insert(
                "uncalibratedTemperature[degF]".to_string(),
                FieldValue::Float(raw_temp_f),
            );
        }
        if let Some(v) = cal_temp_c {
            data.insert("temperature[degC]".to_string(), FieldValue::Float(v));
            data.insert(
                "uncalibratedTemperature[degC]".to_string(),
                FieldValue::Float(raw_temp_c),
            );
        }
        if let Some(v) = cal_sg {
            data.insert("specificGravity".to_string(), FieldValue::Float(v));
            data.insert(
                "uncalibratedSpecificGravity".to_string(),
                FieldValue::Float(raw_sg),
            );
        }
        if let Some(v) = cal_plato {
            data.insert("plato[degP]".to_string(), FieldValue::Float(v));
            data.insert(
                "uncalibratedPlato[degP]".to_string(),
                FieldValue::Float(raw_plato),
            );
        }

        let sync = self.registry.sync_for(&name);

        Ok(Some(TiltMessage {
            name,
            mac,
            color: decoded.color,
            data,
            sync,
        }))
    }

    /// Convert a batch of events into messages, preserving input order.
    /// Invalid events are excluded. The identity store is committed once,
    /// after the whole batch.
    pub fn parse(&mut self, events: &[TiltEvent]) -> Result<Vec<TiltMessage>, RegistryError> {
        let mut messages = Vec::with_capacity(events.len());
        for event in events {
            if let Some(message) = self.parse_event(event)? {
                messages.push(message);
            }
        }
        self.registry.commit()?;
        Ok(messages)
    }

    /// Apply externally requested renames and flush.
    /// Per-pair failures are logged and skipped inside the registry.
    pub fn apply_custom_names(
        &mut self,
        names: &BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        self.registry.apply_custom_names(names);
        self.registry.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::TiltColor;
    use crate::test_utils::{SG_CAL_CONTENT, TEMP_CAL_CONTENT, tilt_event};
    use crate::MacAddress;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    const RED_MAC: MacAddress = MacAddress([0xAA, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);
    const PURPLE_MAC: MacAddress = MacAddress([0xBB, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);
    const BLACK_MAC: MacAddress = MacAddress([0xDD, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);

    fn make_parser(dir: &TempDir) -> EventDataParser {
        let devices_path = dir.path().join("devices.toml");
        fs::write(&devices_path, "[names]\nDD7F97FC141E = \"Black\"\n").unwrap();
        let registry = DeviceRegistry::load(&devices_path).unwrap();

        let temp_cal = Calibrator::from_content(TEMP_CAL_CONTENT);
        let sg_cal = Calibrator::from_content(SG_CAL_CONTENT);

        EventDataParser::new(
            registry,
            temp_cal,
            sg_cal,
            DEFAULT_LOWER_BOUND,
            DEFAULT_UPPER_BOUND,
        )
    }

    fn value(message: &TiltMessage, key: &str) -> f64 {
        message
            .data
            .get(key)
            .unwrap_or_else(|| panic!("key {} missing from {:?}", key, message.data))
            .as_f64()
    }

    #[test]
    fn test_parse_batch() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);
        parser
            .apply_custom_names(&BTreeMap::from([(
                "AA7F97FC141E".to_string(),
                "Ferment 1 red".to_string(),
            )]))
            .unwrap();

        let messages = parser
            .parse(&[
                // Valid red: SG calibration data only
                tilt_event(RED_MAC, TiltColor::Red.uuid(), 68, 1002),
                // Valid black: SG and temperature calibration data
                tilt_event(BLACK_MAC, TiltColor::Black.uuid(), 68, 1002),
                // Invalid: out of bounds SG
                tilt_event(RED_MAC, TiltColor::Red.uuid(), 68, 2500),
                // Invalid: unknown UUID
                tilt_event(RED_MAC, Uuid::nil(), 68, 1002),
                // Valid purple: no calibration data
                tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002),
            ])
            .unwrap();

        assert_eq!(messages.len(), 3);

        // Red: SG calibrated, temperature raw
        let msg = &messages[0];
        assert_eq!(msg.mac, "AA7F97FC141E");
        assert_eq!(msg.color, TiltColor::Red);
        assert_eq!(msg.name, "Ferment 1 red");
        assert_eq!(value(msg, "temperature[degF]"), 68.0);
        assert_eq!(value(msg, "temperature[degC]"), 20.0);
        assert!((value(msg, "specificGravity") - 3.012).abs() < 0.01);
        assert_eq!(value(msg, "uncalibratedSpecificGravity"), 1.002);
        assert_eq!(value(msg, "uncalibratedPlato[degP]"), 0.513);
        assert_eq!(value(msg, "rssi[dBm]"), -80.0);
        assert!(!msg.data.contains_key("uncalibratedTemperature[degF]"));
        assert!(!msg.data.contains_key("uncalibratedTemperature[degC]"));

        // Black: everything calibrated
        let msg = &messages[1];
        assert_eq!(msg.mac, "DD7F97FC141E");
        assert_eq!(msg.color, TiltColor::Black);
        assert_eq!(msg.name, "Black");
        assert_eq!(value(msg, "temperature[degF]"), 70.0);
        assert_eq!(value(msg, "temperature[degC]"), 21.11);
        assert!((value(msg, "specificGravity") - 2.003).abs() < 0.01);
        assert_eq!(value(msg, "uncalibratedTemperature[degF]"), 68.0);
        assert_eq!(value(msg, "uncalibratedTemperature[degC]"), 20.0);
        assert_eq!(value(msg, "uncalibratedSpecificGravity"), 1.002);
        assert!(msg.data.contains_key("uncalibratedPlato[degP]"));

        // Purple: no calibration, no uncalibrated keys
        let msg = &messages[2];
        assert_eq!(msg.mac, "BB7F97FC141E");
        assert_eq!(msg.color, TiltColor::Purple);
        assert_eq!(msg.name, "Purple");
        assert_eq!(value(msg, "temperature[degF]"), 68.0);
        assert_eq!(value(msg, "specificGravity"), 1.002);
        assert_eq!(value(msg, "plato[degP]"), 0.513);
        assert!(!msg.data.keys().any(|k| k.starts_with("uncalibrated")));
    }

    #[test]
    fn test_out_of_bounds_leaves_registry_untouched() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);

        // A device never seen before, with a garbled gravity value
        let unseen = MacAddress([0xEE, 0x7F, 0x97, 0xFC, 0x14, 0x1E]);
        let messages = parser
            .parse(&[tilt_event(unseen, TiltColor::Orange.uuid(), 68, 2500)])
            .unwrap();

        assert!(messages.is_empty());
        assert!(!parser.registry().names().contains_key("EE7F97FC141E"));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);

        // SG 2.000 is exactly the upper bound and passes
        let messages = parser
            .parse(&[tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 2000)])
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(value(&messages[0], "specificGravity"), 2.0);

        // SG 0.499 is below the lower bound and is dropped
        let messages = parser
            .parse(&[tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 499)])
            .unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_pro_model_scaling() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);

        let messages = parser
            .parse(&[tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 689, 10065)])
            .unwrap();

        let msg = &messages[0];
        assert_eq!(value(msg, "specificGravity"), 1.0065);
        assert_eq!(value(msg, "temperature[degF]"), 68.9);
        assert_eq!(value(msg, "temperature[degC]"), 20.5);
    }

    #[test]
    fn test_parse_commits_new_names() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);

        parser
            .parse(&[tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002)])
            .unwrap();

        assert!(!parser.registry().dirty());
        let content = fs::read_to_string(dir.path().join("devices.toml")).unwrap();
        assert!(content.contains("BB7F97FC141E"));
        assert!(content.contains("Purple"));
    }

    #[test]
    fn test_lookup_is_stable_across_batches() {
        let dir = TempDir::new().unwrap();
        let mut parser = make_parser(&dir);
        let event = tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002);

        let first = parser.parse(&[event]).unwrap();
        let second = parser.parse(&[event]).unwrap();
        assert_eq!(first[0].name, second[0].name);
    }

    #[test]
    fn test_sync_rules_attached_by_name() {
        let dir = TempDir::new().unwrap();
        let devices_path = dir.path().join("devices.toml");
        fs::write(
            &devices_path,
            r#"[names]
DD7F97FC141E = "Black"

[[sync]]
type = "TempSensorExternal"
tilt = "Black"
service = "spark-one"
block = "Fridge Sensor"

[[sync]]
type = "TempSensorExternal"
tilt = "Someone Else"
service = "spark-two"
block = "Other"
"#,
        )
        .unwrap();
        let registry = DeviceRegistry::load(&devices_path).unwrap();
        let mut parser = EventDataParser::new(
            registry,
            Calibrator::default(),
            Calibrator::default(),
            DEFAULT_LOWER_BOUND,
            DEFAULT_UPPER_BOUND,
        );

        let messages = parser
            .parse(&[
                tilt_event(BLACK_MAC, TiltColor::Black.uuid(), 68, 1002),
                tilt_event(PURPLE_MAC, TiltColor::Purple.uuid(), 68, 1002),
            ])
            .unwrap();

        assert_eq!(messages[0].sync.len(), 1);
        assert_eq!(messages[0].sync[0].service, "spark-one");
        assert!(messages[1].sync.is_empty());
    }
}
