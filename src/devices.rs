//! Persisted device identity registry.
//!
//! Maps normalized device addresses to stable display names, and carries the
//! sync rules that forward temperature readings into other services. The
//! backing file is human-edited TOML with two top-level sections: a `names`
//! table and a `sync` array of tables. The file is kept as a
//! [`toml_edit::DocumentMut`] so user comments and formatting survive
//! round-trip edits; only touched entries change.
//!
//! Writes are gated on a dirty flag: the registry is mutated in memory and
//! flushed once per parse batch or identity change, never mid-batch.

use crate::mac_address::MacAddress;
use crate::message::SyncRule;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml_edit::{ArrayOfTables, DocumentMut, Item, Table, value};
use tracing::{error, info, warn};

/// Suffix attempts before name assignment gives up. Exhaustion signals a
/// structural bug, not a normal operating condition.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Display names are 1-100 characters from an allow-listed set.
const MAX_NAME_LENGTH: usize = 100;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '(' | ')' | '|')
}

/// Check a display name against the allow-listed character pattern.
pub fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_NAME_LENGTH).contains(&len) && name.chars().all(is_valid_name_char)
}

/// Replace disallowed characters with `_`; an empty result becomes `Unknown`.
fn sanitize_name(name: &str) -> String {
    if name.is_empty() {
        return "Unknown".to_string();
    }
    name.chars()
        .map(|c| if is_valid_name_char(c) { c } else { '_' })
        .collect()
}

/// Errors from the device registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The address handed to `lookup` was not normalized. This is an
    /// integration bug upstream, not bad sensor data.
    #[error("{0} is not a normalized device MAC address")]
    InvalidAddress(String),
    /// More than [`MAX_NAME_ATTEMPTS`] suffixes were tried for one base
    /// name. Escape hatch for bugs; should never occur in practice.
    #[error("name increment attempts exhausted")]
    NameExhausted,
    #[error("device config {path:?} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("failed to parse device config: {0}")]
    Parse(#[from] toml_edit::TomlError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Registry of device display names and sync rules, backed by a TOML file.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    doc: DocumentMut,
    names: BTreeMap<String, String>,
    sync: Vec<SyncRule>,
    dirty: bool,
}

impl DeviceRegistry {
    /// Load the registry from `path`, creating the file when missing.
    ///
    /// Load-time maintenance: persisted names failing the character pattern
    /// are sanitized, and an example sync rule is seeded into an empty
    /// `sync` section to document the expected shape. Both mark the store
    /// dirty and are flushed before this returns.
    pub fn load(path: impl AsRef<Path>) -> Result<DeviceRegistry, RegistryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().append(true).create(true).open(path)?;

        let content = fs::read_to_string(path)?;
        let mut doc: DocumentMut = content.parse()?;

        if !doc.contains_key("names") {
            doc["names"] = Item::Table(Table::new());
        }
        if !doc.contains_key("sync") {
            doc["sync"] = Item::ArrayOfTables(ArrayOfTables::new());
        }

        let mut registry = DeviceRegistry {
            path: path.to_path_buf(),
            doc,
            names: BTreeMap::new(),
            sync: Vec::new(),
            dirty: false,
        };

        registry.read_names()?;
        registry.read_sync()?;
        registry.seed_example_sync_rule();
        registry.sanitize_names();
        registry.commit()?;

        info!(
            "Device config loaded from `{}`: {:?}",
            registry.path.display(),
            registry.names
        );
        Ok(registry)
    }

    fn malformed(&self, reason: impl Into<String>) -> RegistryError {
        RegistryError::Malformed {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn read_names(&mut self) -> Result<(), RegistryError> {
        let table = self.doc["names"]
            .as_table()
            .ok_or_else(|| self.malformed("`names` is not a table"))?;

        let mut names = BTreeMap::new();
        for (mac, item) in table.iter() {
            let name = item
                .as_str()
                .ok_or_else(|| self.malformed(format!("name for `{}` is not a string", mac)))?;
            names.insert(mac.to_string(), name.to_string());
        }
        self.names = names;
        Ok(())
    }

    fn read_sync(&mut self) -> Result<(), RegistryError> {
        let tables = self.doc["sync"]
            .as_array_of_tables()
            .ok_or_else(|| self.malformed("`sync` is not an array of tables"))?;

        let mut sync = Vec::new();
        for table in tables.iter() {
            match parse_sync_rule(table) {
                Some(rule) => sync.push(rule),
                None => warn!("Skipping sync rule with missing fields: {}", table),
            }
        }
        self.sync = sync;
        Ok(())
    }

    /// Seed a placeholder rule into an empty sync section so users can see
    /// the expected shape when editing the file.
    fn seed_example_sync_rule(&mut self) {
        if !self.sync.is_empty() {
            return;
        }
        let example = SyncRule {
            kind: "TempSensorExternal".to_string(),
            tilt: "ExampleTilt".to_string(),
            service: "example-spark-service".to_string(),
            block: "Example Block Name".to_string(),
        };

        let mut table = Table::new();
        table["type"] = value(example.kind.as_str());
        table["tilt"] = value(example.tilt.as_str());
        table["service"] = value(example.service.as_str());
        table["block"] = value(example.block.as_str());
        if let Some(tables) = self.doc["sync"].as_array_of_tables_mut() {
            tables.push(table);
        }

        self.sync.push(example);
        self.dirty = true;
    }

    fn sanitize_names(&mut self) {
        let entries: Vec<(String, String)> = self
            .names
            .iter()
            .map(|(mac, name)| (mac.clone(), name.clone()))
            .collect();

        for (mac, name) in entries {
            if !is_valid_name(&name) {
                let sanitized = sanitize_name(&name);
                warn!(
                    "Sanitizing invalid device name: mac={} name={:?} sanitized={:?}",
                    mac, name, sanitized
                );
                self.doc["names"][mac.as_str()] = value(sanitized.as_str());
                self.names.insert(mac, sanitized);
                self.dirty = true;
            }
        }
    }

    /// All known address to name mappings.
    pub fn names(&self) -> &BTreeMap<String, String> {
        &self.names
    }

    /// All active sync rules, in file order.
    pub fn sync_rules(&self) -> &[SyncRule] {
        &self.sync
    }

    /// Sync rules whose source name matches `name`, in file order.
    pub fn sync_for(&self, name: &str) -> Vec<SyncRule> {
        self.sync
            .iter()
            .filter(|rule| rule.tilt == name)
            .cloned()
            .collect()
    }

    /// Whether there are uncommitted changes.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Pick a free display name: the base name itself, else `base-2`,
    /// `base-3`, and so on.
    fn assign(&self, base_name: &str) -> Result<String, RegistryError> {
        let used: HashSet<&str> = self.names.values().map(String::as_str).collect();
        if !used.contains(base_name) {
            return Ok(base_name.to_string());
        }

        for idx in 2..=MAX_NAME_ATTEMPTS {
            let name = format!("{}-{}", base_name, idx);
            if !used.contains(name.as_str()) {
                return Ok(name);
            }
        }

        // Escape hatch for bugs: >1000 entries for one base name means
        // something upstream went badly wrong.
        Err(RegistryError::NameExhausted)
    }

    /// Resolve the display name for a device, assigning and persisting a new
    /// one on first sight. This is the only path that creates identity
    /// entries.
    ///
    /// `mac` must be normalized (12 uppercase hex characters); anything else
    /// is an upstream bug and fails hard.
    pub fn lookup(&mut self, mac: &str, base_name: &str) -> Result<String, RegistryError> {
        if !MacAddress::is_normalized(mac) {
            return Err(RegistryError::InvalidAddress(mac.to_string()));
        }

        if let Some(name) = self.names.get(mac) {
            return Ok(name.clone());
        }

        let name = self.assign(base_name)?;
        self.doc["names"][mac] = value(name.as_str());
        self.names.insert(mac.to_string(), name.clone());
        self.dirty = true;
        info!("New Tilt detected: {}={}", mac, name);
        Ok(name)
    }

    /// Apply externally requested renames.
    ///
    /// Validation failures are per-pair: the offending pair is logged and
    /// skipped, the rest of the batch continues. Successful pairs overwrite
    /// unconditionally; this path may legally create duplicate display
    /// names.
    pub fn apply_custom_names(&mut self, names: &BTreeMap<String, String>) {
        for (mac, name) in names {
            if !MacAddress::is_normalized(mac) {
                error!(
                    "Failed to set {}={}: {} is not a normalized device MAC address.",
                    mac, name, mac
                );
            } else if !is_valid_name(name) {
                error!("Failed to set {}={}: {} is not a valid device name.", mac, name, name);
            } else {
                info!("Device name set: {}={}", mac, name);
                self.doc["names"][mac.as_str()] = value(name.as_str());
                self.names.insert(mac.clone(), name.clone());
                self.dirty = true;
            }
        }
    }

    /// Flush to disk when dirty. Safe to call redundantly: a clean registry
    /// performs no write.
    pub fn commit(&mut self) -> Result<(), RegistryError> {
        if !self.dirty {
            return Ok(());
        }
        fs::write(&self.path, self.doc.to_string())?;
        self.dirty = false;
        Ok(())
    }
}

fn parse_sync_rule(table: &Table) -> Option<SyncRule> {
    Some(SyncRule {
        kind: table.get("type")?.as_str()?.to_string(),
        tilt: table.get("tilt")?.as_str()?.to_string(),
        service: table.get("service")?.as_str()?.to_string(),
        block: table.get("block")?.as_str()?.to_string(),
    })
}
