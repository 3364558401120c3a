//! Launch and watch the bundled application process.
//!
//! The supervisor starts the child at most once per sidecar lifetime and
//! publishes how it ended. It never restarts the child.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{ProxyError, ProxyResult};

/// How to launch the bundled application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLaunchSpec {
    /// Working directory, where the bundle was extracted.
    pub dir: PathBuf,
    /// Program to run.
    pub cmd: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl AppLaunchSpec {
    /// Build a launch spec from a command line.
    ///
    /// The first whitespace-delimited token is the command and the rest are
    /// arguments. Quoting is not interpreted. A relative `dir` is resolved
    /// against the sidecar's working directory.
    pub fn parse(dir: impl Into<PathBuf>, main: &str) -> ProxyResult<Self> {
        let mut tokens = main.split_whitespace().map(ToString::to_string);
        let cmd = tokens
            .next()
            .ok_or_else(|| ProxyError::config("main must name a command"))?;

        Ok(Self {
            dir: absolute_dir(dir.into())?,
            cmd,
            args: tokens.collect(),
            env: Vec::new(),
        })
    }

    /// Attach environment variables for the child.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Program path handed to the OS.
    ///
    /// Relative paths with a separator (`./server`, `bin/app`) are resolved
    /// against the working directory; bare names go through `PATH`.
    pub fn program(&self) -> PathBuf {
        let cmd = Path::new(&self.cmd);
        if cmd.is_relative() && cmd.components().count() > 1 {
            self.dir.join(cmd)
        } else {
            cmd.to_path_buf()
        }
    }
}

/// `dir` anchored at the sidecar's working directory when relative.
///
/// The child runs with `dir` as its working directory, so a relative `dir`
/// would be resolved twice.
pub fn absolute_dir(dir: PathBuf) -> ProxyResult<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().map_err(|e| {
        ProxyError::config(format!("cannot resolve {}: {e}", dir.display()))
    })?;
    Ok(cwd.join(dir))
}

/// How the application process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process terminated with this code.
    Exited(i32),
    /// The process could not be started.
    SpawnError(String),
}

impl ProcessOutcome {
    /// Convert into the error reported to waiting callers.
    pub fn into_error(self) -> ProxyError {
        match self {
            Self::Exited(exit_code) => ProxyError::ReadinessFailure { exit_code },
            Self::SpawnError(message) => ProxyError::spawn(message),
        }
    }
}

/// One-shot launcher for the bundled application.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    outcome: Mutex<Option<watch::Receiver<Option<ProcessOutcome>>>>,
    pid: AtomicU32,
}

impl ProcessSupervisor {
    /// Create a supervisor that has not launched anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a launch was attempted.
    pub fn is_launched(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Pid of the child, once it is running.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Outcome of the launch, if it already resolved.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.outcome
            .lock()
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    /// Launch the application on first call and wait for it to end.
    ///
    /// Later callers never launch again; they wait on the same outcome,
    /// whatever `spec` they pass.
    pub async fn spawn_once(&self, spec: &AppLaunchSpec) -> ProcessOutcome {
        let mut rx = self.launch(spec);
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(ProcessOutcome::Exited(-1))
    }

    fn launch(&self, spec: &AppLaunchSpec) -> watch::Receiver<Option<ProcessOutcome>> {
        let mut guard = self.outcome.lock();
        if let Some(rx) = guard.as_ref() {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        let program = spec.program();
        info!(
            program = %program.display(),
            args = ?spec.args,
            dir = %spec.dir.display(),
            "launching application"
        );

        let spawned = Command::new(&program)
            .args(&spec.args)
            .current_dir(&spec.dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                if let Some(pid) = child.id() {
                    self.pid.store(pid, Ordering::SeqCst);
                    info!(pid, "application started");
                }

                tokio::spawn(async move {
                    let code = match child.wait().await {
                        Ok(status) => exit_code(status),
                        Err(e) => {
                            error!(error = %e, "failed to wait on application process");
                            -1
                        }
                    };
                    warn!(code, "application process exited");
                    tx.send_replace(Some(ProcessOutcome::Exited(code)));
                });
            }
            Err(e) => {
                error!(program = %program.display(), error = %e, "failed to launch application");
                tx.send_replace(Some(ProcessOutcome::SpawnError(e.to_string())));
            }
        }

        *guard = Some(rx.clone());
        rx
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
