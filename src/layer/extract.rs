use crate::errors::{is_disk_full, LayerError};
use flate2::read::GzDecoder;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tar::{Archive, EntryType};
use tokio::sync::OwnedMutexGuard;

/// Unpack a gzip compressed tar archive on top of `root`
///
/// This is an overlay: entries replace files at the same path, everything
/// else already under `root` stays. Layers must therefore be applied in
/// manifest order. `progress` receives the fraction of the compressed file
/// consumed so far.
///
/// Dropping the returned future stops the extraction thread before its next
/// read or entry.
pub async fn extract_overlay(
    archive: &Path,
    root: &Path,
    progress: Arc<dyn Fn(f64) + Send + Sync>,
) -> Result<u64, LayerError> {
    extract_holding(archive, root, progress, None).await
}

/// Like [extract_overlay], keeping `busy` locked until the extraction
/// thread itself has finished, even if the caller gave up on it earlier
pub(crate) async fn extract_holding(
    archive: &Path,
    root: &Path,
    progress: Arc<dyn Fn(f64) + Send + Sync>,
    busy: Option<OwnedMutexGuard<()>>,
) -> Result<u64, LayerError> {
    let archive = archive.to_path_buf();
    let root = root.to_path_buf();
    let cancel = CancelOnDrop(Arc::new(AtomicBool::new(false)));
    let cancelled = cancel.0.clone();
    tokio::task::spawn_blocking(move || {
        let _busy = busy;
        extract_blocking(&archive, &root, &*progress, &cancelled)
    })
    .await?
}

/// Raises the flag once the awaiting future is gone
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn extract_blocking(
    archive_path: &Path,
    root: &Path,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancelled: &AtomicBool,
) -> Result<u64, LayerError> {
    let wrap = |source: io::Error| {
        if cancelled.load(Ordering::Relaxed) {
            LayerError::Cancelled
        } else {
            extract_error(archive_path, root, source)
        }
    };

    std::fs::create_dir_all(root).map_err(|e| LayerError::from_io(e, root))?;
    let file = File::open(archive_path).map_err(wrap)?;
    let total = file.metadata().map_err(wrap)?.len();
    if total > 512 * 1024 {
        log::info!("extracting {} bytes from {:?} ...", total, archive_path);
    }

    let reader = CountingReader {
        inner: BufReader::new(file),
        count: 0,
        total,
        progress,
        cancelled,
    };
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    let mut count: u64 = 0;
    for entry in archive.entries().map_err(wrap)? {
        if cancelled.load(Ordering::Relaxed) {
            return Err(LayerError::Cancelled);
        }
        let mut entry = entry.map_err(wrap)?;
        let kind = entry.header().entry_type();
        let path = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(err) => return Err(wrap(err)),
        };
        let relative = match relative_to_root(&path) {
            Some(relative) => relative,
            None => {
                log::warn!("skipping tar entry outside of root: {:?}", path);
                continue;
            }
        };
        if kind != EntryType::Directory && !relative.as_os_str().is_empty() {
            // an existing directory is merged into, never replaced
            remove_conflicting_dir(root, &relative);
        }
        match kind {
            EntryType::Regular
            | EntryType::Directory
            | EntryType::Symlink
            | EntryType::Link
            | EntryType::Fifo => {
                if !entry.unpack_in(root).map_err(wrap)? {
                    log::warn!("skipping tar entry outside of root: {:?}", path);
                }
                count += 1;
            }
            _ => log::debug!(
                "skipping unsupported tar file entry type {:?}, {:?}",
                kind,
                path
            ),
        }
    }
    progress(1.0);
    log::debug!("extracted {} entries from {:?}", count, archive_path);
    Ok(count)
}

/// The entry path as it lands under the root, or `None` if it climbs out
///
/// Leading `/` is dropped the same way [tar::Entry::unpack_in] drops it.
fn relative_to_root(path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
        }
    }
    Some(relative)
}

/// A later layer may turn a directory into a file or link; the old empty
/// directory would block that.
fn remove_conflicting_dir(root: &Path, entry_path: &Path) {
    let target = root.join(entry_path);
    if let Ok(meta) = std::fs::symlink_metadata(&target) {
        if meta.is_dir() {
            let _ = std::fs::remove_dir(&target);
        }
    }
}

fn extract_error(archive: &Path, root: &Path, source: io::Error) -> LayerError {
    if is_disk_full(&source) {
        LayerError::DiskFull(root.to_path_buf())
    } else {
        LayerError::Extract {
            archive: PathBuf::from(archive),
            source,
        }
    }
}

struct CountingReader<'a, R> {
    inner: R,
    count: u64,
    total: u64,
    progress: &'a (dyn Fn(f64) + Send + Sync),
    cancelled: &'a AtomicBool,
}

impl<'a, R: Read> Read for CountingReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "extraction cancelled"));
        }
        let len = self.inner.read(buf)?;
        self.count += len as u64;
        if self.total > 0 && len > 0 {
            (self.progress)((self.count as f64 / self.total as f64).min(1.0));
        }
        Ok(len)
    }
}
