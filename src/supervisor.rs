//! Starting, watching and stopping the long-running sandboxed processes

use crate::{errors::ProcessError, events::LogSink, sandbox::SandboxCommand};
use regex::Regex;
use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{watch, Mutex},
    task::JoinHandle,
};

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

const OUTPUT_TAIL_LINES: usize = 200;
const FAILURE_DETAIL_LINES: usize = 12;
const DRAIN_LINGER: Duration = Duration::from_secs(1);

lazy_static! {
    static ref READY_LINE: Regex =
        Regex::new(r"(?i-u)listening on|server started|\bready\b|serving").unwrap();
    static ref ERROR_LINE: Regex =
        Regex::new(r"(?i-u)error|exception|fatal|failed|cannot|not found|eaddrinuse").unwrap();
}

/// The two supervised processes
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// The agent gateway
    Primary,
    /// Static web UI server
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        })
    }
}

/// One running (or exited) supervised process
///
/// Clones refer to the same process.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    role: Role,
    pid: u32,
    exit: watch::Receiver<Option<ExitStatus>>,
    ready_line: watch::Receiver<bool>,
    output: StdMutex<VecDeque<String>>,
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ProcessHandle {}

impl ProcessHandle {
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn is_alive(&self) -> bool {
        self.inner.exit.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.inner.exit.borrow()
    }

    /// The most recent `count` output lines, oldest first
    pub fn output_tail(&self, count: usize) -> Vec<String> {
        match self.inner.output.lock() {
            Ok(output) => {
                let skip = output.len().saturating_sub(count);
                output.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// A short excerpt explaining a failure
    ///
    /// Lines that look like errors win over plain output.
    pub fn failure_detail(&self) -> String {
        let tail = self.output_tail(OUTPUT_TAIL_LINES);
        let errors: Vec<&String> = tail.iter().filter(|l| ERROR_LINE.is_match(l)).collect();
        let chosen: Vec<&String> = if errors.is_empty() {
            tail.iter().collect()
        } else {
            errors
        };
        let skip = chosen.len().saturating_sub(FAILURE_DETAIL_LINES);
        chosen
            .into_iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<&str>>()
            .join("\n")
    }

    /// Resolves `true` once a readiness line shows up in the output, or
    /// `false` if the process exits first
    pub async fn wait_ready_line(&self) -> bool {
        let mut ready = self.inner.ready_line.clone();
        let mut exit = self.inner.exit.clone();
        loop {
            if *ready.borrow_and_update() {
                return true;
            }
            if exit.borrow_and_update().is_some() {
                return false;
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        // output is closed, only an exit can follow
                        let _ = exit.wait_for(|status| status.is_some()).await;
                        return *ready.borrow();
                    }
                }
                changed = exit.changed() => {
                    if changed.is_err() {
                        return *ready.borrow();
                    }
                }
            }
        }
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut exit = self.inner.exit.clone();
        let waited = match tokio::time::timeout(timeout, exit.wait_for(|status| status.is_some())).await {
            Ok(Ok(status)) => *status,
            _ => None,
        };
        waited.or_else(|| self.exit_status())
    }

    /// Wait for the process to exit, however long that takes
    pub async fn exited(&self) -> Option<ExitStatus> {
        let mut exit = self.inner.exit.clone();
        let waited = match exit.wait_for(|status| status.is_some()).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        waited.or_else(|| self.exit_status())
    }

    /// Send a signal to the process and everything in its group
    pub fn signal(&self, signal: libc::c_int) -> Result<(), ProcessError> {
        let pgid = self.inner.pid as libc::pid_t;
        if unsafe { libc::kill(-pgid, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // already gone
            Ok(())
        } else {
            Err(ProcessError::Signal {
                role: self.inner.role,
                source: err,
            })
        }
    }

    fn record_line(&self, line: &str) {
        if let Ok(mut output) = self.inner.output.lock() {
            while output.len() >= OUTPUT_TAIL_LINES {
                output.pop_front();
            }
            output.push_back(line.to_string());
        }
    }
}

/// Owns at most one process per [Role]
#[derive(Clone, Debug)]
pub struct Supervisor {
    handles: Arc<Mutex<HashMap<Role, ProcessHandle>>>,
    log: LogSink,
    grace: Duration,
}

impl Supervisor {
    pub fn new(log: LogSink, grace: Duration) -> Self {
        Supervisor {
            handles: Arc::new(Mutex::new(HashMap::new())),
            log,
            grace,
        }
    }

    /// Current handle for a role, alive or not
    pub async fn get(&self, role: Role) -> Option<ProcessHandle> {
        self.handles.lock().await.get(&role).cloned()
    }

    pub async fn is_running(&self, role: Role) -> bool {
        match self.get(role).await {
            Some(handle) => handle.is_alive(),
            None => false,
        }
    }

    /// Launch a process for `role`, or return the one already alive
    ///
    /// The handle table stays locked from spawn to registration, so a
    /// concurrent [Supervisor::stop] always sees the new process.
    pub async fn start(
        &self,
        role: Role,
        command: &SandboxCommand,
    ) -> Result<ProcessHandle, ProcessError> {
        let mut handles = self.handles.lock().await;
        if let Some(existing) = handles.get(&role) {
            if existing.is_alive() {
                log::debug!("{} process already running, pid {}", role, existing.pid());
                return Ok(existing.clone());
            }
        }

        log::debug!("spawn {} {:?} {:?}", role, command.program, command.args);
        let mut cmd = command.to_command();
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|source| ProcessError::Spawn { role, source })?;
        let pid = child.id().ok_or(ProcessError::InvalidPid(role))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let handle = ProcessHandle {
            inner: Arc::new(HandleInner {
                role,
                pid,
                exit: exit_rx,
                ready_line: ready_rx,
                output: StdMutex::new(VecDeque::new()),
            }),
        };

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(self.drain(handle.clone(), stdout, ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(self.drain(handle.clone(), stderr, ready_tx.clone()));
        }
        drop(ready_tx);

        let log = self.log.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(err) => {
                    log::warn!("wait for {} process failed: {}", role, err);
                    ExitStatus::from_raw(0xff << 8)
                }
            };
            // let the drains catch the final lines, but don't hang on a
            // grandchild that still holds the pipe
            for drain in drains {
                let _ = tokio::time::timeout(DRAIN_LINGER, drain).await;
            }
            log.push(format!("{} process exited, {}", role, status));
            let _ = exit_tx.send(Some(status));
        });

        self.log.push(format!("Started {} process, pid {}", role, pid));
        handles.insert(role, handle.clone());
        Ok(handle)
    }

    /// Copy output lines into the handle's tail for as long as the pipe is
    /// open; a full pipe would stall the child.
    fn drain<R>(
        &self,
        handle: ProcessHandle,
        stream: R,
        ready_tx: Arc<watch::Sender<bool>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.log.clone();
        tokio::spawn(async move {
            let role = handle.role();
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        log::debug!("[{}] {}", role, line);
                        handle.record_line(&line);
                        if READY_LINE.is_match(&line) {
                            ready_tx.send_replace(true);
                            log.push(format!("[{}] {}", role, line));
                        } else if ERROR_LINE.is_match(&line) {
                            log.push(format!("[{}] {}", role, line));
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // not utf8 or similar; keep draining
                        log::trace!("[{}] unreadable output: {}", role, err);
                        if err.kind() != io::ErrorKind::InvalidData {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Terminate gracefully, then kill if the grace period runs out
    ///
    /// Returns the exit status if the process was known and has exited.
    pub async fn stop(&self, role: Role) -> Result<Option<ExitStatus>, ProcessError> {
        let handle = match self.handles.lock().await.remove(&role) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        if !handle.is_alive() {
            return Ok(handle.exit_status());
        }

        self.log.push(format!("Stopping {} process", role));
        handle.signal(libc::SIGTERM)?;
        if let Some(status) = handle.wait_exit(self.grace).await {
            return Ok(Some(status));
        }

        log::warn!("{} process ignored SIGTERM for {:?}, killing", role, self.grace);
        handle.signal(libc::SIGKILL)?;
        Ok(handle.wait_exit(self.grace).await)
    }

    /// Kill every tracked process immediately
    pub async fn force_stop_all(&self) {
        let drained: Vec<ProcessHandle> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in drained {
            if handle.is_alive() {
                log::warn!("killing {} process, pid {}", handle.role(), handle.pid());
                if let Err(err) = handle.signal(libc::SIGKILL) {
                    log::error!("{}", err);
                }
            }
        }
    }
}
