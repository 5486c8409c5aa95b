use crate::layer::LayerSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

/// Location of the ledger, relative to the root filesystem
pub const LEDGER_PATH: &str = "var/lib/sandstrap/layers.json";

/// What is known about one materialized layer
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub version: String,
    #[serde(rename = "installedAt")]
    pub installed_at: DateTime<Utc>,
}

/// Persisted record of which layer versions are on disk
///
/// An entry is only ever written after its layer has been fully extracted.
#[derive(Clone, Debug)]
pub struct VersionLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl VersionLedger {
    /// Load the ledger belonging to a root filesystem
    ///
    /// A missing or unreadable file is an empty ledger, not an error.
    pub fn load(rootfs: &Path) -> VersionLedger {
        let path = rootfs.join(LEDGER_PATH);
        let entries = match std::fs::read(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("can't read layer ledger {:?}, ignoring it: {}", path, e);
                BTreeMap::new()
            }
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("corrupt layer ledger {:?}, ignoring it: {}", path, e);
                    BTreeMap::new()
                }
            },
        };
        VersionLedger { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, layer: &str) -> Option<&LedgerEntry> {
        self.entries.get(layer)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &LedgerEntry)> {
        self.entries.iter()
    }

    /// Layers from the manifest whose entry is missing or has another version,
    /// in manifest order
    pub fn stale_layers(&self, manifest: &[LayerSpec]) -> Vec<LayerSpec> {
        manifest
            .iter()
            .filter(|layer| match self.entries.get(&layer.name) {
                Some(entry) => entry.version != layer.version,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Record a layer as installed now and rewrite the whole ledger
    pub fn commit(&mut self, layer: &str, version: &str) -> io::Result<()> {
        self.entries.insert(
            layer.to_string(),
            LedgerEntry {
                version: version.to_string(),
                installed_at: Utc::now(),
            },
        );
        self.save()
    }

    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&self.path, json)
    }
}
