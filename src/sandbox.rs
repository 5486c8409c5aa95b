//! Building command lines that run inside the userspace sandbox
//!
//! Nothing here touches the filesystem or spawns anything; the result is a
//! plain argument vector plus host environment, ready for a process launcher.

use crate::config::COMPAT_SHIM_GUEST_PATH;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Search path used inside the sandbox
pub const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host directories bound into every sandbox
pub const HOST_BINDS: &[&str] = &["/dev", "/proc", "/sys"];

/// A fully formed host command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Host environment additions for the sandbox engine itself
    pub env: Vec<(String, String)>,
}

impl SandboxCommand {
    /// Prepare a launcher with piped output and no stdin
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd
    }
}

/// Setup for sandboxed commands, ending with [SandboxBuilder::command()]
#[derive(Clone, Debug)]
pub struct SandboxBuilder {
    engine: PathBuf,
    rootfs: PathBuf,
    native_lib_dir: Option<PathBuf>,
    staging_lib_dir: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    loader: Option<PathBuf>,
    working_dir: String,
    binds: Vec<(String, Option<String>)>,
    env: Vec<String>,
}

impl SandboxBuilder {
    /// Start from the sandbox engine binary and the assembled root
    pub fn new<E: AsRef<Path>, R: AsRef<Path>>(engine: E, rootfs: R) -> Self {
        SandboxBuilder {
            engine: engine.as_ref().to_path_buf(),
            rootfs: rootfs.as_ref().to_path_buf(),
            native_lib_dir: None,
            staging_lib_dir: None,
            tmp_dir: None,
            loader: None,
            working_dir: "/root".to_string(),
            binds: HOST_BINDS.iter().map(|b| (b.to_string(), None)).collect(),
            env: Vec::new(),
        }
        .env("HOME", "/root")
        .env("PATH", GUEST_PATH)
        .env("TERM", "xterm-256color")
        .env("LANG", "C.UTF-8")
        .env("NODE_OPTIONS", format!("--require {}", COMPAT_SHIM_GUEST_PATH))
    }

    /// Directory holding the sandbox engine's own shared libraries
    ///
    /// Also the default location of its loader helper.
    pub fn native_lib_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.native_lib_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Private directory for extra libraries the engine needs
    pub fn staging_lib_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.staging_lib_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Writable directory for the engine's temporary files
    pub fn tmp_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.tmp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Override the loader helper location
    pub fn loader<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.loader = Some(path.as_ref().to_path_buf());
        self
    }

    /// Initial working directory, as seen inside the sandbox
    pub fn current_dir<S: AsRef<str>>(mut self, dir: S) -> Self {
        self.working_dir = dir.as_ref().to_string();
        self
    }

    /// Bind an extra host path, optionally at a different guest path
    pub fn bind<S: AsRef<str>>(mut self, host: S, guest: Option<S>) -> Self {
        self.binds.push((
            host.as_ref().to_string(),
            guest.map(|g| g.as_ref().to_string()),
        ));
        self
    }

    /// Add or replace one variable of the sandboxed environment
    pub fn env<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, val: V) -> Self {
        env::set(&mut self.env, key.as_ref(), val.as_ref());
        self
    }

    /// Add or replace many environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, val) in vars {
            self = self.env(key, val);
        }
        self
    }

    /// Remove one variable entirely, leaving it unset
    pub fn env_remove<K: AsRef<str>>(mut self, key: K) -> Self {
        env::remove(&mut self.env, key.as_ref());
        self
    }

    /// Run `command_line` through `/bin/sh -c` inside the sandbox
    pub fn command<S: AsRef<str>>(&self, command_line: S) -> SandboxCommand {
        self.exec(&["/bin/sh", "-c", command_line.as_ref()])
    }

    /// Run an argument vector inside the sandbox without a shell
    pub fn exec<S: AsRef<OsStr>>(&self, argv: &[S]) -> SandboxCommand {
        let mut args: Vec<String> = vec![
            "--kill-on-exit".to_string(),
            "--link2symlink".to_string(),
            "-0".to_string(),
            "-r".to_string(),
            self.rootfs.to_string_lossy().into_owned(),
        ];
        for (host, guest) in &self.binds {
            args.push("-b".to_string());
            match guest {
                Some(guest) => args.push(format!("{}:{}", host, guest)),
                None => args.push(host.clone()),
            }
        }
        args.push("-w".to_string());
        args.push(self.working_dir.clone());

        // minimal wrapper so nothing from the host environment leaks in
        args.push("/usr/bin/env".to_string());
        args.push("-i".to_string());
        args.extend(self.env.iter().cloned());
        args.extend(argv.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));

        SandboxCommand {
            program: self.engine.clone(),
            args,
            env: self.host_env(),
        }
    }

    fn host_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let lib_path: Vec<String> = self
            .staging_lib_dir
            .iter()
            .chain(self.native_lib_dir.iter())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if !lib_path.is_empty() {
            env.push(("LD_LIBRARY_PATH".to_string(), lib_path.join(":")));
        }
        if let Some(tmp) = &self.tmp_dir {
            env.push(("PROOT_TMP_DIR".to_string(), tmp.to_string_lossy().into_owned()));
        }
        let loader = match (&self.loader, &self.native_lib_dir) {
            (Some(loader), _) => Some(loader.clone()),
            (None, Some(dir)) => Some(dir.join("libproot-loader.so")),
            (None, None) => None,
        };
        if let Some(loader) = loader {
            env.push(("PROOT_LOADER".to_string(), loader.to_string_lossy().into_owned()));
        }
        env
    }
}

mod env {
    fn key_of(item: &str) -> &str {
        item.splitn(2, '=').next().unwrap_or(item)
    }

    pub fn set(env: &mut Vec<String>, key: &str, value: &str) {
        let joined = format!("{}={}", key, value);
        for item in env.iter_mut() {
            if key_of(item) == key {
                *item = joined;
                return;
            }
        }
        env.push(joined)
    }

    pub fn remove(env: &mut Vec<String>, key: &str) -> Option<String> {
        let index = env.iter().position(|item| key_of(item) == key)?;
        Some(env.remove(index))
    }
}
