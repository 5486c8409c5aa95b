//! Filesystem layers: description, download, extraction and bookkeeping

mod download;
mod extract;
mod ledger;
mod manifest;
mod provision;

pub use download::{Downloader, MAX_REDIRECTS};
pub use extract::extract_overlay;
pub(crate) use extract::extract_holding;
pub use ledger::{LedgerEntry, VersionLedger, LEDGER_PATH};
pub use manifest::{ManifestResolver, DEFAULT_LAYER_BASE_URL, DEFAULT_MANIFEST_URL};
pub use provision::{LayerProgress, LayerSource, ProgressPhase, ProgressTracker, Provisioner};
pub(crate) use provision::layer_fraction;

use std::fmt;
use url::Url;

/// One named, versioned archive that gets unpacked into the root filesystem
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    /// Bundled file name to look for before going to the network
    pub source_asset: Option<String>,
    pub fallback_url: String,
    /// Expected compressed size, only used to weight progress
    pub size_bytes: u64,
    pub version: String,
    /// Optional hex sha256 of the compressed archive
    pub sha256: Option<String>,
}

impl LayerSpec {
    /// Build a layer whose archive lives at `base_url` + `file`
    ///
    /// The version comes from the file name when not given explicitly.
    pub fn from_file(
        name: &str,
        file: &str,
        version: Option<&str>,
        size_bytes: u64,
        base_url: &Url,
    ) -> Result<LayerSpec, url::ParseError> {
        Ok(LayerSpec {
            name: name.to_string(),
            source_asset: Some(file.to_string()),
            fallback_url: base_url.join(file)?.to_string(),
            size_bytes,
            version: match version {
                Some(v) => v.to_string(),
                None => version_from_file(file),
            },
            sha256: None,
        })
    }

    /// Human readable compressed size
    pub fn display_size(&self) -> String {
        display_size(self.size_bytes)
    }

    /// Name of the archive file, whether bundled or downloaded
    pub fn file_name(&self) -> String {
        match &self.source_asset {
            Some(file) => file.clone(),
            None => self
                .fallback_url
                .rsplit('/')
                .next()
                .unwrap_or(&self.name)
                .to_string(),
        }
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The compiled-in layer list, used whenever the remote manifest can't be
/// used
pub fn default_layers(base_url: &Url) -> Vec<LayerSpec> {
    const DEFAULTS: &[(&str, &str, u64)] = &[
        ("base", "base-1.0.tar.gz", 31_337_938),
        ("runtime", "runtime-22.11.tar.gz", 28_510_208),
        ("app", "app-1.4.2.tar.gz", 61_865_984),
    ];
    DEFAULTS
        .iter()
        .filter_map(|(name, file, size)| {
            LayerSpec::from_file(name, file, None, *size, base_url).ok()
        })
        .collect()
}

/// Guess a layer version from its archive name
///
/// `base-1.2.tar.gz` gives `1.2` and `engine-v3.tgz` gives `v3`. Without a
/// dash-separated suffix that looks like a version, the whole stem is used.
pub fn version_from_file(file: &str) -> String {
    let stem = [".tar.gz", ".tgz", ".tar"]
        .iter()
        .find_map(|ext| file.strip_suffix(ext))
        .unwrap_or(file);
    match stem.rsplit_once('-') {
        Some((_, suffix)) if looks_like_version(suffix) => suffix.to_string(),
        _ => stem.to_string(),
    }
}

fn looks_like_version(s: &str) -> bool {
    let digits = s.strip_prefix('v').unwrap_or(s);
    digits.chars().next().map_or(false, |c| c.is_ascii_digit())
}

/// Format a byte count the way the setup screens show it
pub fn display_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
