//! The top-level sequence: layers, config, then both services
//!
//! An [Orchestrator] owns one background worker at a time. Callers never wait
//! on it directly; they start a run with [Orchestrator::bootstrap] or
//! [Orchestrator::quick_start] and watch [Status] and the log feed, or use
//! [Orchestrator::wait] when they want the typed result.

mod state;

pub use state::{BootstrapState, Status};

use crate::{
    config::{self, GatewayConfig},
    errors::{BootstrapError, LayerError, ProcessError},
    events::{LogSink, DEFAULT_LOG_CAPACITY},
    layer::{
        default_layers, layer_fraction, Downloader, LayerProgress, LayerSource, LayerSpec,
        ManifestResolver, ProgressPhase, ProgressTracker, Provisioner, VersionLedger,
        DEFAULT_LAYER_BASE_URL, DEFAULT_MANIFEST_URL,
    },
    readiness::{ReadinessPoller, POLL_INTERVAL},
    sandbox::SandboxBuilder,
    supervisor::{ProcessHandle, Role, Supervisor, DEFAULT_STOP_GRACE},
};
use state::StatusBoard;
use std::{
    fmt,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
};
use url::Url;

/// Share of the progress bar for downloading and extracting layers
pub const PROVISION_CEILING: f64 = 0.7;
/// Progress once the primary process answers
pub const PRIMARY_CEILING: f64 = 0.9;
const CONFIG_WRITTEN: f64 = 0.75;

/// Guest files whose presence, with a non-empty ledger, means provisioning
/// finished: the interpreter and the application entry point
pub const DEFAULT_MARKERS: &[&str] = &["/usr/bin/node", "/usr/local/lib/gateway/gateway.mjs"];

pub const DEFAULT_SECONDARY_PORT: u16 = 18790;

/// How to launch one supervised process and how long it may take to answer
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceSpec {
    /// Shell command line run inside the sandbox; `{port}` is substituted
    pub command: String,
    pub port: u16,
    pub ready_timeout: Duration,
}

impl ServiceSpec {
    pub fn new<S: Into<String>>(command: S, port: u16, ready_timeout: Duration) -> Self {
        ServiceSpec {
            command: command.into(),
            port,
            ready_timeout,
        }
    }

    pub fn command_line(&self) -> String {
        self.command.replace("{port}", &self.port.to_string())
    }

    /// The agent gateway; its port comes from the [GatewayConfig]
    pub fn default_primary() -> Self {
        ServiceSpec::new(
            format!(
                "node /usr/local/lib/gateway/gateway.mjs gateway --config {} --port {{port}}",
                config::CONFIG_GUEST_PATH
            ),
            config::DEFAULT_GATEWAY_PORT,
            Duration::from_secs(60),
        )
    }

    /// Static server for the web UI
    pub fn default_secondary() -> Self {
        ServiceSpec::new(
            "node /usr/local/lib/gateway/webui.mjs --port {port}",
            DEFAULT_SECONDARY_PORT,
            Duration::from_secs(30),
        )
    }
}

/// Host directories derived from the data directory
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPaths {
    pub root: PathBuf,
    /// The assembled root filesystem
    pub rootfs: PathBuf,
    /// The sandbox engine's scratch files
    pub tmp: PathBuf,
    /// Layer archives being downloaded, emptied at the start of every run
    pub downloads: PathBuf,
    /// Private library staging directory
    pub lib: PathBuf,
    /// Default location of bundled layer archives
    pub assets: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        DataPaths {
            root: root.to_path_buf(),
            rootfs: root.join("rootfs"),
            tmp: root.join("tmp"),
            downloads: root.join("tmp").join("downloads"),
            lib: root.join("lib"),
            assets: root.join("assets"),
        }
    }
}

/// Builder for configuring [Orchestrator] instances
pub struct OrchestratorBuilder {
    data_dir: Option<PathBuf>,
    assets_dir: Option<PathBuf>,
    manifest_url: String,
    layer_base_url: String,
    fallback_layers: Option<Vec<LayerSpec>>,
    offline: bool,
    proot: Option<PathBuf>,
    native_lib_dir: Option<PathBuf>,
    markers: Vec<String>,
    primary: ServiceSpec,
    secondary: ServiceSpec,
    stop_grace: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    poll_interval: Duration,
    log_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        OrchestratorBuilder {
            data_dir: None,
            assets_dir: None,
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            layer_base_url: DEFAULT_LAYER_BASE_URL.to_string(),
            fallback_layers: None,
            offline: false,
            proot: None,
            native_lib_dir: None,
            markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
            primary: ServiceSpec::default_primary(),
            secondary: ServiceSpec::default_secondary(),
            stop_grace: DEFAULT_STOP_GRACE,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            poll_interval: POLL_INTERVAL,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Change the data directory
    ///
    /// Everything lives below it: the root filesystem, temporary downloads,
    /// staged libraries and, unless [OrchestratorBuilder::assets_dir] says
    /// otherwise, bundled archives. The default can be determined with
    /// [Orchestrator::default_data_dir()]
    pub fn data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = Some(dir.to_path_buf());
        self
    }

    /// Directory searched for bundled layer archives
    pub fn assets_dir(mut self, dir: &Path) -> Self {
        self.assets_dir = Some(dir.to_path_buf());
        self
    }

    pub fn manifest_url(mut self, url: &str) -> Self {
        self.manifest_url = url.to_string();
        self
    }

    /// Base that layer file names are resolved against
    pub fn layer_base_url(mut self, url: &str) -> Self {
        self.layer_base_url = url.to_string();
        self
    }

    /// Replace the compiled-in layer list used when no manifest is available
    pub fn fallback_layers(mut self, layers: Vec<LayerSpec>) -> Self {
        self.fallback_layers = Some(layers);
        self
    }

    /// Never use the network
    ///
    /// The fallback layer list is used and only bundled archives can be
    /// applied.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Path to the sandbox engine binary
    ///
    /// Defaults to `$SANDSTRAP_PROOT`, or `proot` from the search path.
    pub fn proot(mut self, path: &Path) -> Self {
        self.proot = Some(path.to_path_buf());
        self
    }

    /// Directory of the sandbox engine's own libraries and loader
    pub fn native_lib_dir(mut self, dir: &Path) -> Self {
        self.native_lib_dir = Some(dir.to_path_buf());
        self
    }

    /// Guest paths that must exist once all layers are applied
    pub fn markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Primary service; its port is replaced by the config's port at start
    pub fn primary(mut self, service: ServiceSpec) -> Self {
        self.primary = service;
        self
    }

    pub fn secondary(mut self, service: ServiceSpec) -> Self {
        self.secondary = service;
        self
    }

    /// Time allowed between SIGTERM and SIGKILL when stopping
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set a timeout for only the initial connect phase of each download
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set a timeout for each read of a download body
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Delay between readiness probes
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of log lines retained for late observers
    pub fn log_capacity(mut self, lines: usize) -> Self {
        self.log_capacity = lines;
        self
    }

    /// Construct an Orchestrator using the parameters from this Builder
    pub fn build(self) -> Result<Orchestrator, BootstrapError> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => Orchestrator::default_data_dir()?,
        };
        log::info!("using data directory {:?}", data_dir);
        let paths = DataPaths::new(&data_dir);

        let base_url = Url::parse(&self.layer_base_url)?;
        let fallback = match self.fallback_layers {
            Some(layers) => layers,
            None => default_layers(&base_url),
        };
        let mut resolver = ManifestResolver::new(&self.manifest_url, base_url).fallback(fallback);
        let downloader = if self.offline {
            resolver = resolver.offline();
            None
        } else {
            Some(
                Downloader::new(self.connect_timeout, self.read_timeout)
                    .map_err(BootstrapError::Client)?,
            )
        };
        let assets_dir = self.assets_dir.unwrap_or_else(|| paths.assets.clone());
        let provisioner = Provisioner::new(Some(assets_dir), paths.downloads.clone(), downloader);

        let engine = match self.proot {
            Some(path) => path,
            None => std::env::var_os("SANDSTRAP_PROOT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("proot")),
        };
        log::debug!("sandbox engine {:?}", engine);
        let mut sandbox = SandboxBuilder::new(&engine, &paths.rootfs)
            .staging_lib_dir(&paths.lib)
            .tmp_dir(&paths.tmp);
        if let Some(dir) = &self.native_lib_dir {
            sandbox = sandbox.native_lib_dir(dir);
        }

        let log = LogSink::new(self.log_capacity);
        let (running, _) = watch::channel(false);
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                markers: self.markers,
                resolver,
                provisioner,
                sandbox,
                supervisor: Supervisor::new(log.clone(), self.stop_grace),
                poller: ReadinessPoller::with_interval(self.poll_interval),
                primary: self.primary,
                secondary: self.secondary,
                status: StatusBoard::new(log.clone()),
                log,
                running,
                run: Mutex::new(RunSlot::default()),
                last_config: Mutex::new(None),
                paths,
            }),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RunMode {
    Bootstrap,
    QuickStart,
}

#[derive(Default)]
struct RunSlot {
    worker: Option<JoinHandle<Result<(), BootstrapError>>>,
    abort: Option<AbortHandle>,
    watchers: Vec<JoinHandle<()>>,
}

struct Inner {
    paths: DataPaths,
    markers: Vec<String>,
    resolver: ManifestResolver,
    provisioner: Provisioner,
    sandbox: SandboxBuilder,
    supervisor: Supervisor,
    poller: ReadinessPoller,
    primary: ServiceSpec,
    secondary: ServiceSpec,
    log: LogSink,
    status: StatusBoard,
    running: watch::Sender<bool>,
    run: Mutex<RunSlot>,
    last_config: Mutex<Option<GatewayConfig>>,
}

/// Clears the running flag however the worker ends, including abort
struct RunGuard(Arc<Inner>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.send_replace(false);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provisions the root filesystem and keeps both services running
///
/// Cloning gives another handle to the same orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("paths", &self.inner.paths)
            .field("status", &self.inner.status.current())
            .finish()
    }
}

impl Orchestrator {
    /// Construct a new orchestrator with default settings
    pub fn new() -> Result<Self, BootstrapError> {
        OrchestratorBuilder::new().build()
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Return the default data directory
    ///
    /// `$SANDSTRAP_HOME` if set, else `sandstrap` under `$XDG_DATA_HOME`, else
    /// `~/.local/share/sandstrap`.
    pub fn default_data_dir() -> Result<PathBuf, BootstrapError> {
        let var = |name| std::env::var_os(name).filter(|v| !v.is_empty());
        if let Some(dir) = var("SANDSTRAP_HOME") {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = var("XDG_DATA_HOME") {
            return Ok(PathBuf::from(dir).join("sandstrap"));
        }
        match var("HOME") {
            Some(home) => Ok(PathBuf::from(home).join(".local/share/sandstrap")),
            None => Err(BootstrapError::NoDefaultDataDir),
        }
    }

    pub fn paths(&self) -> &DataPaths {
        &self.inner.paths
    }

    /// Provision every missing or stale layer, then start both services
    ///
    /// Returns as soon as the run is under way. Must be called from within a
    /// tokio runtime.
    pub fn bootstrap(&self, config: GatewayConfig) -> Result<(), BootstrapError> {
        self.launch(RunMode::Bootstrap, config)
    }

    /// Restart the services on an already provisioned root filesystem
    ///
    /// Layers the manifest has moved past are still updated first. Fails with
    /// [BootstrapError::NotProvisioned] if nothing was ever installed.
    pub fn quick_start(&self, config: GatewayConfig) -> Result<(), BootstrapError> {
        self.launch(RunMode::QuickStart, config)
    }

    /// Start over after an error, with the configuration of the failed run
    pub fn retry(&self) -> Result<(), BootstrapError> {
        let state = self.inner.status.current().state;
        if state.is_active() {
            return Err(BootstrapError::Busy);
        }
        if !matches!(state, BootstrapState::Error(_)) {
            return Err(BootstrapError::NothingToRetry);
        }
        let config = lock(&self.inner.last_config)
            .clone()
            .ok_or(BootstrapError::NothingToRetry)?;
        self.launch(RunMode::Bootstrap, config)
    }

    fn launch(&self, mode: RunMode, config: GatewayConfig) -> Result<(), BootstrapError> {
        let mut slot = lock(&self.inner.run);
        if *self.inner.running.borrow() {
            return Err(BootstrapError::Busy);
        }
        if self.inner.status.current().state == BootstrapState::Running {
            self.inner.log.push("Already running");
            return Ok(());
        }

        *lock(&self.inner.last_config) = Some(config.clone());
        self.inner.running.send_replace(true);
        let guard = RunGuard(self.inner.clone());
        let inner = self.inner.clone();
        let worker = tokio::spawn(async move {
            let _guard = guard;
            inner.run(mode, config).await
        });
        slot.abort = Some(worker.abort_handle());
        slot.worker = Some(worker);
        Ok(())
    }

    /// Wait for the current run to finish and return its result
    ///
    /// Returns `Ok` immediately when no run was started since the last wait.
    /// A run cut short by [Orchestrator::stop] also counts as `Ok`.
    pub async fn wait(&self) -> Result<(), BootstrapError> {
        let worker = lock(&self.inner.run).worker.take();
        match worker {
            None => Ok(()),
            Some(worker) => match worker.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Stop both services gracefully and return to `Idle`
    ///
    /// A run in progress is abandoned first. Layers already recorded in the
    /// ledger stay installed.
    pub async fn stop(&self) -> Result<(), BootstrapError> {
        self.halt_worker().await;
        self.inner.status.reset();
        let secondary = self.inner.supervisor.stop(Role::Secondary).await;
        let primary = self.inner.supervisor.stop(Role::Primary).await;
        secondary?;
        primary?;
        self.inner.log.push("Stopped");
        Ok(())
    }

    /// Kill everything immediately, for use when the host is going away
    pub async fn shutdown(&self) {
        self.halt_worker().await;
        self.inner.supervisor.force_stop_all().await;
        self.inner.status.reset();
    }

    async fn halt_worker(&self) {
        let (abort, watchers) = {
            let mut slot = lock(&self.inner.run);
            (slot.abort.take(), std::mem::take(&mut slot.watchers))
        };
        if let Some(abort) = abort {
            abort.abort();
        }
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
        self.inner.provisioner.wait_idle().await;
        for watcher in watchers {
            watcher.abort();
            let _ = watcher.await;
        }
    }

    pub fn status(&self) -> Status {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_logs(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.inner.log.subscribe()
    }

    /// Retained log lines, oldest first
    pub fn log_lines(&self) -> Vec<String> {
        self.inner.log.lines()
    }

    /// The ledger as it is on disk right now
    pub fn ledger(&self) -> VersionLedger {
        VersionLedger::load(&self.inner.paths.rootfs)
    }

    /// Marker files not present in the root filesystem
    pub fn missing_markers(&self) -> Vec<PathBuf> {
        self.inner.missing_markers()
    }

    /// True when a ledger exists and every marker file is present
    pub fn is_provisioned(&self) -> bool {
        !self.ledger().is_empty() && self.missing_markers().is_empty()
    }

    /// Configuration of the most recent run, with any generated token
    pub fn config(&self) -> Option<GatewayConfig> {
        lock(&self.inner.last_config).clone()
    }

    pub async fn process(&self, role: Role) -> Option<ProcessHandle> {
        self.inner.supervisor.get(role).await
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mode: RunMode, config: GatewayConfig) -> Result<(), BootstrapError> {
        let result = self.run_steps(mode, &config).await;
        if let Err(err) = &result {
            self.log.push(format!("Error: {}", err));
            self.status.fail(err.to_string());
        }
        result
    }

    async fn run_steps(
        self: &Arc<Self>,
        mode: RunMode,
        config: &GatewayConfig,
    ) -> Result<(), BootstrapError> {
        let from = self.status.current().state;
        for dir in &[&self.paths.rootfs, &self.paths.tmp, &self.paths.lib] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| BootstrapError::DataDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        clear_dir(&self.paths.downloads).await;

        let layers = self.resolver.resolve(&self.log).await;
        let mut ledger = VersionLedger::load(&self.paths.rootfs);
        let stale = ledger.stale_layers(&layers);

        // stale layers are reinstalled below, and may bring missing markers
        // back; only a root that never had a layer is refused here
        if mode == RunMode::QuickStart && ledger.is_empty() {
            let mut missing = vec![ledger.path().to_path_buf()];
            missing.extend(self.missing_markers());
            return Err(BootstrapError::NotProvisioned { missing });
        }

        if mode == RunMode::QuickStart
            && stale.is_empty()
            && from == BootstrapState::Idle
            && self.missing_markers().is_empty()
        {
            self.status.begin_run(BootstrapState::Starting);
        } else {
            self.status.begin_run(BootstrapState::Preparing);
            self.provision(&mut ledger, &stale).await?;
            let missing = self.missing_markers();
            if !missing.is_empty() {
                return Err(BootstrapError::NotProvisioned { missing });
            }
        }

        self.status.transition(BootstrapState::Starting);
        self.status.advance(PROVISION_CEILING);
        self.log.push("Writing configuration");
        let effective = config::write_config(&self.paths.rootfs, config)?;
        *lock(&self.last_config) = Some(effective.clone());
        self.status.advance(CONFIG_WRITTEN);

        let primary = ServiceSpec {
            port: effective.port,
            ..self.primary.clone()
        };
        self.start_service(Role::Primary, &primary).await?;
        self.status.transition(BootstrapState::WaitingForSecondaryProcess);
        self.status.advance(PRIMARY_CEILING);

        self.start_service(Role::Secondary, &self.secondary).await?;
        self.status.transition(BootstrapState::Running);
        self.status.advance(1.0);
        self.log.push(format!(
            "Running, gateway on port {}, web UI on port {}",
            effective.port, self.secondary.port
        ));
        self.watch_processes();
        Ok(())
    }

    /// Apply `stale` in order, committing each to the ledger only once it is
    /// fully extracted; stops at the first failure
    async fn provision(
        &self,
        ledger: &mut VersionLedger,
        stale: &[LayerSpec],
    ) -> Result<(), BootstrapError> {
        if stale.is_empty() {
            self.log.push("All layers up to date");
            return Ok(());
        }
        let names: Vec<String> = stale.iter().map(|l| l.to_string()).collect();
        self.log.push(format!("Installing {}", names.join(", ")));

        let mut tracker = ProgressTracker::new(stale, 0.0, PROVISION_CEILING);
        for layer in stale {
            self.status.transition(BootstrapState::Preparing);
            let downloaded = matches!(self.provisioner.source(layer), LayerSource::Remote(_));
            let progress = self.layer_progress(layer, &tracker, downloaded);

            let layer_error = |source: LayerError| BootstrapError::Layer {
                layer: layer.name.clone(),
                source,
            };
            let entries = self
                .provisioner
                .apply(layer, &self.paths.rootfs, progress)
                .await
                .map_err(layer_error)?;
            ledger
                .commit(&layer.name, &layer.version)
                .map_err(|e| layer_error(LayerError::from_io(e, ledger.path())))?;

            self.status.advance(tracker.complete(layer));
            self.log.push(format!("Installed {} ({} entries)", layer, entries));
        }
        Ok(())
    }

    fn layer_progress(
        &self,
        layer: &LayerSpec,
        tracker: &ProgressTracker,
        downloaded: bool,
    ) -> LayerProgress {
        let status = self.status.clone();
        let log = self.log.clone();
        let tracker = tracker.clone();
        let layer = layer.clone();
        Arc::new(move |phase: ProgressPhase, fraction: f64| {
            let entered = match phase {
                ProgressPhase::Download => status.transition(BootstrapState::Downloading),
                ProgressPhase::Extract => status.transition(BootstrapState::Extracting),
            };
            if entered {
                match phase {
                    ProgressPhase::Download => {
                        log.push(format!("Downloading {} ({})", layer, layer.display_size()))
                    }
                    ProgressPhase::Extract => log.push(format!("Extracting {}", layer)),
                }
            }
            status.advance(tracker.overall(&layer, layer_fraction(phase, fraction, downloaded)));
        })
    }

    /// Start one service and wait until it prints a readiness line or
    /// answers on its port, failing fast if it exits
    async fn start_service(&self, role: Role, service: &ServiceSpec) -> Result<(), BootstrapError> {
        let command = self.sandbox.command(service.command_line());
        let handle = self.supervisor.start(role, &command).await?;
        self.log.push(format!(
            "Waiting for {} process on port {}",
            role, service.port
        ));

        let outcome = tokio::select! {
            ready = handle.wait_ready_line() => {
                if ready {
                    Ok(())
                } else {
                    Err(ProcessError::ExitedEarly {
                        role,
                        status: handle
                            .exit_status()
                            .unwrap_or_else(|| ExitStatus::from_raw(0xff << 8)),
                        output: handle.failure_detail(),
                    })
                }
            }
            polled = self.poller.wait(service.port, service.ready_timeout) => {
                polled.map_err(|last_error| ProcessError::ReadinessTimeout {
                    port: service.port,
                    timeout: service.ready_timeout,
                    last_error,
                    output: handle.failure_detail(),
                })
            }
        };

        if let Err(err) = outcome {
            // leave nothing half started behind for the next attempt
            if let Err(stop_err) = self.supervisor.stop(role).await {
                log::warn!("{}", stop_err);
            }
            return Err(err.into());
        }
        self.log.push(format!("The {} process is ready", role));
        Ok(())
    }

    /// Turn an unexpected exit after startup into an `Error` state
    fn watch_processes(self: &Arc<Self>) {
        let mut watchers = Vec::new();
        for role in [Role::Primary, Role::Secondary] {
            let inner = self.clone();
            watchers.push(tokio::spawn(async move {
                let handle = match inner.supervisor.get(role).await {
                    Some(handle) => handle,
                    None => return,
                };
                let status = handle.exited().await;
                if inner.status.current().state == BootstrapState::Running {
                    let status = match status {
                        Some(status) => status.to_string(),
                        None => "unknown status".to_string(),
                    };
                    let message = format!(
                        "{} process exited unexpectedly, {}\n{}",
                        role,
                        status,
                        handle.failure_detail()
                    );
                    inner.log.push(format!("Error: {}", message));
                    inner.status.fail(message);
                }
            }));
        }
        lock(&self.run).watchers.extend(watchers);
    }

    fn missing_markers(&self) -> Vec<PathBuf> {
        self.markers
            .iter()
            .map(|marker| config::guest_to_host(&self.paths.rootfs, marker))
            .filter(|path| !path.exists())
            .collect()
    }
}

/// Remove whatever an interrupted run left in `dir`
async fn clear_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let removed = match entry.file_type().await {
            Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        match removed {
            Ok(()) => log::debug!("removed leftover {:?}", path),
            Err(e) => log::warn!("could not remove leftover {:?}: {}", path, e),
        }
    }
}
