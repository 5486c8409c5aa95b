//! Error types you might see while provisioning layers or supervising
//! processes

use crate::supervisor::Role;
use std::{path::PathBuf, process::ExitStatus, time::Duration};
use thiserror::Error;

/// Errors while materializing one layer into the root filesystem
#[derive(Error, Debug)]
pub enum LayerError {
    /// network request error
    #[error("network request error: {0}")]
    NetworkRequest(#[from] reqwest::Error),

    /// server answered with an unexpected status
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// redirect chain exceeded the allowed length
    #[error("too many redirects while fetching {0}")]
    TooManyRedirects(String),

    /// redirect response did not say where to go
    #[error("redirect from {0} without a usable Location header")]
    MissingRedirectLocation(String),

    /// we are in offline mode, but a download was requested
    #[error("we are in offline mode, but a download was requested")]
    DownloadInOfflineMode,

    /// invalid download url
    #[error("invalid download url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// no space left on the device holding the root filesystem
    #[error("no space left on device while writing {0:?}")]
    DiskFull(PathBuf),

    /// archive could not be unpacked
    #[error("failed to extract {archive:?}: {source}")]
    Extract {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// calculated digest of downloaded content is not what the manifest
    /// promised
    #[error("content digest mismatch, expected {expected}, found {found}")]
    ContentDigestMismatch { expected: String, found: String },

    /// asynchronous task failed during layer preparation
    #[error("asynchronous task failed during layer preparation")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// the run was stopped while this layer was being unpacked
    #[error("extraction cancelled")]
    Cancelled,
}

impl LayerError {
    /// Classify an io error, recognizing a full disk separately
    pub(crate) fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        if is_disk_full(&err) {
            LayerError::DiskFull(path.to_path_buf())
        } else {
            LayerError::Storage(err)
        }
    }
}

/// True for ENOSPC, including when it is wrapped inside another error, as
/// the tar crate does with failures while unpacking an entry
pub(crate) fn is_disk_full(err: &std::io::Error) -> bool {
    if err.raw_os_error() == Some(libc::ENOSPC) || err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    let mut next = err
        .get_ref()
        .map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(cause) = next {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(libc::ENOSPC) || io.kind() == std::io::ErrorKind::StorageFull {
                return true;
            }
        }
        next = cause.source();
    }
    false
}

/// Why the remote layer manifest could not be used
#[derive(Error, Debug)]
pub enum ManifestError {
    /// offline mode, the manifest is never fetched
    #[error("offline mode")]
    Offline,

    /// network request error
    #[error("network request error: {0}")]
    NetworkRequest(#[from] reqwest::Error),

    /// server answered with something other than 200
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// body is not a manifest document
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    #[error("manifest lists no layers")]
    Empty,

    #[error("manifest layer missing name or file")]
    IncompleteLayer,

    /// a layer file name does not resolve against the base url
    #[error("invalid layer url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Last failed attempt to reach a local listener
#[derive(Error, Debug)]
pub enum ReadinessError {
    /// nothing accepted the connection, or the attempt timed out
    #[error("{0}")]
    Request(#[from] reqwest::Error),

    /// the listener answered with a server error
    #[error("status {0}")]
    Status(u16),
}

/// Errors that occur while starting, watching, or stopping a supervised
/// process
#[derive(Error, Debug)]
pub enum ProcessError {
    /// the sandbox engine could not be launched
    #[error("failed to spawn {role} process: {source}")]
    Spawn {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    /// os refused to deliver a signal
    #[error("failed to signal {role} process: {source}")]
    Signal {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    /// spawned child had no pid, it was already reaped
    #[error("{0} process has no pid")]
    InvalidPid(Role),

    /// process exited before it started accepting connections
    #[error("{role} process exited before becoming ready, {status}\n{output}")]
    ExitedEarly {
        role: Role,
        status: ExitStatus,
        output: String,
    },

    /// nothing answered on the port in time
    #[error("no response on port {port} after {timeout:?}, last error: {last_error}\n{output}")]
    ReadinessTimeout {
        port: u16,
        timeout: Duration,
        #[source]
        last_error: ReadinessError,
        output: String,
    },
}

/// Errors writing the generated runtime configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// io error
    #[error("config io error: {0}")]
    IOError(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
}

/// Coarse classification of a [BootstrapError]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// a layer could not be downloaded or unpacked
    Layer,
    /// a supervised process failed to come up
    ProcessStartup,
    /// the runtime configuration could not be written
    Config,
    /// the call was not valid in the current state
    Usage,
    /// the orchestrator itself failed
    Internal,
}

/// Errors from a bootstrap or quick start run
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// one layer failed; the run was aborted
    #[error("layer {layer} failed: {source}")]
    Layer {
        layer: String,
        #[source]
        source: LayerError,
    },

    /// layers are applied but required files are still missing
    #[error("root filesystem is incomplete, missing {missing:?}")]
    NotProvisioned { missing: Vec<PathBuf> },

    /// config writer failed
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// process startup failed
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// a run is already in progress
    #[error("a bootstrap run is already in progress")]
    Busy,

    /// retry requested but no earlier run exists
    #[error("nothing to retry")]
    NothingToRetry,

    /// can't determine where to keep the root filesystem
    #[error("can't determine a data directory, set SANDSTRAP_HOME")]
    NoDefaultDataDir,

    /// data directory could not be created
    #[error("can't prepare data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// invalid manifest or layer base url
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// download client could not be constructed
    #[error("can't set up download client: {0}")]
    Client(#[source] LayerError),

    /// orchestration task failed
    #[error("orchestration task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl BootstrapError {
    /// Which part of the taxonomy this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::Layer { .. } | BootstrapError::NotProvisioned { .. } => {
                ErrorKind::Layer
            }
            BootstrapError::Config(_) => ErrorKind::Config,
            BootstrapError::Process(_) => ErrorKind::ProcessStartup,
            BootstrapError::Busy
            | BootstrapError::NothingToRetry
            | BootstrapError::NoDefaultDataDir
            | BootstrapError::InvalidUrl(_) => ErrorKind::Usage,
            BootstrapError::DataDir { .. }
            | BootstrapError::Client(_)
            | BootstrapError::TaskJoin(_) => ErrorKind::Internal,
        }
    }
}
