use crate::{
    errors::ManifestError,
    events::LogSink,
    layer::{default_layers, LayerSpec},
};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MANIFEST_URL: &str = "https://downloads.sandstrap.dev/layers/manifest.json";
pub const DEFAULT_LAYER_BASE_URL: &str = "https://downloads.sandstrap.dev/layers/";

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote layer manifest document
///
/// `{"layers": [{"name": str, "file": str, "version": str, "size": int}]}`
#[derive(Clone, Debug, Deserialize)]
struct ManifestDocument {
    layers: Vec<ManifestLayer>,
}

#[derive(Clone, Debug, Deserialize)]
struct ManifestLayer {
    name: String,
    file: String,
    #[serde(default)]
    version: Option<String>,
    size: u64,
    #[serde(default)]
    sha256: Option<String>,
}

/// Fetches the current layer list, never failing
///
/// Any problem with the remote document (network, status, json shape) yields
/// the compiled-in list instead.
#[derive(Clone, Debug)]
pub struct ManifestResolver {
    req: Option<reqwest::Client>,
    manifest_url: String,
    base_url: Url,
    fallback: Vec<LayerSpec>,
}

impl ManifestResolver {
    pub fn new(manifest_url: &str, base_url: Url) -> Self {
        let req = reqwest::Client::builder()
            .connect_timeout(MANIFEST_TIMEOUT)
            .timeout(MANIFEST_TIMEOUT)
            .build()
            .ok();
        ManifestResolver {
            req,
            manifest_url: manifest_url.to_string(),
            fallback: default_layers(&base_url),
            base_url,
        }
    }

    /// Never touch the network, always return the fallback list
    pub fn offline(mut self) -> Self {
        self.req = None;
        self
    }

    /// Replace the compiled-in fallback list
    pub fn fallback(mut self, layers: Vec<LayerSpec>) -> Self {
        self.fallback = layers;
        self
    }

    pub fn fallback_layers(&self) -> &[LayerSpec] {
        &self.fallback
    }

    /// Resolve the ordered layer list for this provisioning pass
    pub async fn resolve(&self, log: &LogSink) -> Vec<LayerSpec> {
        match self.fetch().await {
            Ok(layers) => {
                let summary: Vec<String> = layers.iter().map(|l| l.to_string()).collect();
                log.push(format!("Manifest: {}", summary.join(", ")));
                layers
            }
            Err(err) => {
                log::debug!("using built-in layer list, manifest unavailable: {}", err);
                self.fallback.clone()
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<LayerSpec>, ManifestError> {
        let req = self.req.as_ref().ok_or(ManifestError::Offline)?;
        log::info!("<{}> fetching layer manifest...", self.manifest_url);
        let response = req.get(&self.manifest_url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ManifestError::HttpStatus(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        log::trace!("raw json manifest, {}", String::from_utf8_lossy(&body));
        parse_manifest(&body, &self.base_url)
    }
}

fn parse_manifest(body: &[u8], base_url: &Url) -> Result<Vec<LayerSpec>, ManifestError> {
    let doc: ManifestDocument = serde_json::from_slice(body)?;
    if doc.layers.is_empty() {
        return Err(ManifestError::Empty);
    }
    let mut layers = Vec::with_capacity(doc.layers.len());
    for entry in doc.layers {
        if entry.name.is_empty() || entry.file.is_empty() {
            return Err(ManifestError::IncompleteLayer);
        }
        let mut layer = LayerSpec::from_file(
            &entry.name,
            &entry.file,
            entry.version.as_deref(),
            entry.size,
            base_url,
        )?;
        layer.sha256 = entry.sha256.map(|s| s.to_ascii_lowercase());
        layers.push(layer);
    }
    Ok(layers)
}
