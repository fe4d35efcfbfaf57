use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::records::{InstallRecord, StoredRecord};

const RECORDS_FILE_VERSION: u32 = 1;

/// The two persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Installing,
    Installed,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
        }
    }
}

/// Keyed storage for the two record collections. The tracker treats the
/// store as a black box responsible for its own durability.
pub trait StateStore {
    fn load(&self, slot: Slot) -> Result<Vec<StoredRecord>>;
    fn save(&self, slot: Slot, records: &[InstallRecord]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsFile {
    version: u32,
    #[serde(default)]
    installing: Vec<serde_json::Value>,
    #[serde(default)]
    installed: Vec<serde_json::Value>,
}

/// File-backed store: one pretty-printed JSON document holding both slots.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_file(&self) -> Result<RecordsFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(RecordsFile {
                    version: RECORDS_FILE_VERSION,
                    ..RecordsFile::default()
                });
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read install records: {}", self.path.display())
                });
            }
        };

        match serde_json::from_str::<RecordsFile>(&raw) {
            Ok(file) => Ok(file),
            Err(err) => {
                // Persisted state must stay usable across versions; an
                // unreadable file is recovered as empty, not thrown.
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "install records file is unreadable; starting from empty state"
                );
                Ok(RecordsFile {
                    version: RECORDS_FILE_VERSION,
                    ..RecordsFile::default()
                })
            }
        }
    }

    fn write_file(&self, file: &RecordsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(file).with_context(|| {
            format!("failed serializing install records: {}", self.path.display())
        })?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write install records: {}", self.path.display()))
    }

    fn decode_entries(&self, slot: Slot, entries: &[serde_json::Value]) -> Vec<StoredRecord> {
        entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        slot = slot.as_str(),
                        error = %err,
                        "dropping corrupt install record entry"
                    );
                    None
                }
            })
            .collect()
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, slot: Slot) -> Result<Vec<StoredRecord>> {
        let file = self.read_file()?;
        let entries = match slot {
            Slot::Installing => &file.installing,
            Slot::Installed => &file.installed,
        };
        Ok(self.decode_entries(slot, entries))
    }

    fn save(&self, slot: Slot, records: &[InstallRecord]) -> Result<()> {
        let mut file = self.read_file()?;
        file.version = RECORDS_FILE_VERSION;
        let encoded = records
            .iter()
            .map(|record| {
                serde_json::to_value(StoredRecord::Record(record.clone()))
                    .context("failed serializing install record")
            })
            .collect::<Result<Vec<_>>>()?;
        match slot {
            Slot::Installing => file.installing = encoded,
            Slot::Installed => file.installed = encoded,
        }
        self.write_file(&file)
    }
}
