//! Materializing layers and reporting progress across several of them

use crate::{
    errors::LayerError,
    layer::{extract_holding, Downloader, LayerSpec},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;

/// Where a layer's archive comes from
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayerSource {
    /// Shipped alongside the application, no network needed
    Bundled(PathBuf),
    Remote(String),
}

/// What operational phase a progress report is about
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressPhase {
    Download,
    Extract,
}

/// Progress callback shared with the extraction thread
pub type LayerProgress = Arc<dyn Fn(ProgressPhase, f64) + Send + Sync>;

/// Downloads (or finds) and extracts one layer at a time
///
/// The provisioner never touches the version ledger; committing a layer is
/// the caller's job, once [Provisioner::apply] has returned `Ok`.
///
/// Clones share one extraction slot, see [Provisioner::wait_idle].
#[derive(Clone, Debug)]
pub struct Provisioner {
    assets_dir: Option<PathBuf>,
    tmp_dir: PathBuf,
    downloader: Option<Downloader>,
    extracting: Arc<Mutex<()>>,
}

impl Provisioner {
    /// Downloads go to `tmp_dir`, which is created on demand
    pub fn new(assets_dir: Option<PathBuf>, tmp_dir: PathBuf, downloader: Option<Downloader>) -> Self {
        Provisioner {
            assets_dir,
            tmp_dir,
            downloader,
            extracting: Arc::new(Mutex::new(())),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Wait until no extraction thread is writing into a root filesystem
    ///
    /// An abandoned [Provisioner::apply] stops its extraction thread at the
    /// next entry, but cannot join it; this can.
    pub async fn wait_idle(&self) {
        let _idle = self.extracting.lock().await;
    }

    /// Prefer a bundled asset with the layer's file name
    pub fn source(&self, layer: &LayerSpec) -> LayerSource {
        if let (Some(dir), Some(asset)) = (&self.assets_dir, &layer.source_asset) {
            let path = dir.join(asset);
            if path.is_file() {
                return LayerSource::Bundled(path);
            }
        }
        LayerSource::Remote(layer.fallback_url.clone())
    }

    /// Fetch if needed, then unpack the layer over `root`
    ///
    /// A downloaded archive is deleted afterwards whether or not extraction
    /// worked, and also when the returned future is dropped part way. Errors
    /// are returned as-is; there are no retries here.
    pub async fn apply(
        &self,
        layer: &LayerSpec,
        root: &Path,
        progress: LayerProgress,
    ) -> Result<u64, LayerError> {
        match self.source(layer) {
            LayerSource::Bundled(path) => {
                log::info!("{} using bundled archive {:?}", layer, path);
                self.extract(&path, root, progress).await
            }
            LayerSource::Remote(url) => {
                let downloader = self
                    .downloader
                    .as_ref()
                    .ok_or(LayerError::DownloadInOfflineMode)?;
                let temp = TempFile(self.temp_path(layer));
                progress(ProgressPhase::Download, 0.0);
                downloader
                    .download(
                        &url,
                        &temp.0,
                        layer.size_bytes,
                        layer.sha256.as_deref(),
                        |f| progress(ProgressPhase::Download, f),
                    )
                    .await?;
                self.extract(&temp.0, root, progress).await
            }
        }
    }

    async fn extract(&self, archive: &Path, root: &Path, progress: LayerProgress) -> Result<u64, LayerError> {
        let busy = self.extracting.clone().lock_owned().await;
        progress(ProgressPhase::Extract, 0.0);
        let report: Arc<dyn Fn(f64) + Send + Sync> =
            Arc::new(move |f: f64| progress(ProgressPhase::Extract, f));
        extract_holding(archive, root, report, Some(busy)).await
    }

    fn temp_path(&self, layer: &LayerSpec) -> PathBuf {
        let ts = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis(),
            Err(_) => 0,
        };
        self.tmp_dir
            .join(format!("{}.{}.{}", std::process::id(), ts, layer.file_name()))
    }
}

/// Downloaded archive, removed when this goes out of scope
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => log::debug!("removed {:?}", self.0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::debug!("could not remove {:?}: {}", self.0, e),
        }
    }
}

/// Combines per-layer fractions into one bar
///
/// Each layer weighs its declared size. The result is scaled into
/// `floor..ceiling`, the share of the overall bar set aside for provisioning.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    total: u64,
    completed: u64,
    floor: f64,
    ceiling: f64,
}

impl ProgressTracker {
    pub fn new(layers: &[LayerSpec], floor: f64, ceiling: f64) -> Self {
        ProgressTracker {
            total: layers.iter().map(weight).sum(),
            completed: 0,
            floor,
            ceiling,
        }
    }

    /// Overall fraction while `layer` is `layer_fraction` done
    pub fn overall(&self, layer: &LayerSpec, layer_fraction: f64) -> f64 {
        if self.total == 0 {
            return self.ceiling;
        }
        let partial = weight(layer) as f64 * layer_fraction.clamp(0.0, 1.0);
        let done = ((self.completed as f64 + partial) / self.total as f64).min(1.0);
        self.floor + (self.ceiling - self.floor) * done
    }

    /// Mark a layer as fully applied, returning the new overall fraction
    pub fn complete(&mut self, layer: &LayerSpec) -> f64 {
        self.completed = (self.completed + weight(layer)).min(self.total);
        self.overall(layer, 0.0)
    }
}

/// Layers with no declared size still count for something
fn weight(layer: &LayerSpec) -> u64 {
    layer.size_bytes.max(1)
}

/// Fraction of one layer's work, given the phase it is in
///
/// Downloaded layers spend the first half downloading and the second half
/// extracting; bundled layers only extract.
pub(crate) fn layer_fraction(phase: ProgressPhase, fraction: f64, downloaded: bool) -> f64 {
    match (phase, downloaded) {
        (ProgressPhase::Download, _) => 0.5 * fraction,
        (ProgressPhase::Extract, true) => 0.5 + 0.5 * fraction,
        (ProgressPhase::Extract, false) => fraction,
    }
}
