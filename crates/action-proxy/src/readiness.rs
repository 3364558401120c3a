//! One-time readiness decision for the target application.
//!
//! The first caller of [`ReadinessCoordinator::ensure_ready`] starts a single
//! background race between a liveness poll and the bundled process ending.
//! Whichever finishes first decides the outcome for the whole sidecar
//! lifetime; every caller, concurrent or later, observes that same outcome.
//!
//! ```text
//! NotStarted ──ensure_ready──► Racing ──poll ok──────► Ready
//!                                 └────process ended──► Failed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::supervisor::{AppLaunchSpec, ProcessOutcome, ProcessSupervisor};

/// Per-attempt timeout of a liveness request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the readiness race ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The application answered the liveness probe.
    Ready,
    /// The application process ended first.
    ProcessExited(i32),
    /// The application process could not be started.
    ProcessSpawnError(String),
    /// `alive_timeout` elapsed before the application answered.
    TimedOut(Duration),
}

impl ReadinessOutcome {
    /// Whether the application is serving.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Convert into the result handed to callers.
    pub fn into_result(self) -> ProxyResult<()> {
        match self {
            Self::Ready => Ok(()),
            Self::ProcessExited(code) => Err(ProcessOutcome::Exited(code).into_error()),
            Self::ProcessSpawnError(message) => Err(ProcessOutcome::SpawnError(message).into_error()),
            Self::TimedOut(limit) => Err(ProxyError::ReadinessTimeout(limit)),
        }
    }
}

impl From<ProcessOutcome> for ReadinessOutcome {
    fn from(outcome: ProcessOutcome) -> Self {
        match outcome {
            ProcessOutcome::Exited(code) => Self::ProcessExited(code),
            ProcessOutcome::SpawnError(message) => Self::ProcessSpawnError(message),
        }
    }
}

/// Observable state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Nobody asked yet.
    NotStarted,
    /// The race is running.
    Racing,
    /// The application is serving.
    Ready,
    /// The application will never be served.
    Failed,
}

/// Memoized readiness gate shared by every `run` call.
#[derive(Debug)]
pub struct ReadinessCoordinator {
    client: reqwest::Client,
    supervisor: Arc<ProcessSupervisor>,
    gate: Mutex<Option<watch::Receiver<Option<ReadinessOutcome>>>>,
    attempts: Arc<AtomicU64>,
}

impl ReadinessCoordinator {
    /// Create a coordinator that launches through `supervisor`.
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::server(format!("failed to create probe client: {e}")))?;

        Ok(Self {
            client,
            supervisor,
            gate: Mutex::new(None),
            attempts: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Current state.
    pub fn state(&self) -> ReadinessState {
        match self.gate.lock().as_ref() {
            None => ReadinessState::NotStarted,
            Some(rx) => match &*rx.borrow() {
                None => ReadinessState::Racing,
                Some(ReadinessOutcome::Ready) => ReadinessState::Ready,
                Some(_) => ReadinessState::Failed,
            },
        }
    }

    /// Resolved outcome, if the race is over.
    pub fn outcome(&self) -> Option<ReadinessOutcome> {
        self.gate.lock().as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Number of liveness requests sent so far.
    pub fn probe_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until the application is serving.
    ///
    /// `config` and `launch` are only used by the call that starts the race.
    pub async fn ensure_ready(
        &self,
        config: &ProxyConfig,
        launch: Option<&AppLaunchSpec>,
    ) -> ProxyResult<()> {
        let rx = self.start(config, launch);
        Self::wait(rx).await
    }

    /// Wait on a race handle returned by [`Self::start`].
    pub(crate) async fn wait(
        mut rx: watch::Receiver<Option<ReadinessOutcome>>,
    ) -> ProxyResult<()> {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        outcome
            .ok_or_else(|| ProxyError::server("readiness race ended without an outcome"))?
            .into_result()
    }

    /// Start the race unless it already started, returning its handle.
    ///
    /// Synchronous, so callers can start it while holding their own lock.
    pub(crate) fn start(
        &self,
        config: &ProxyConfig,
        launch: Option<&AppLaunchSpec>,
    ) -> watch::Receiver<Option<ReadinessOutcome>> {
        let mut gate = self.gate.lock();
        if let Some(rx) = gate.as_ref() {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        let race = Race {
            client: self.client.clone(),
            supervisor: self.supervisor.clone(),
            attempts: self.attempts.clone(),
            config: config.clone(),
            launch: launch.cloned(),
        };

        info!(
            url = %config.alive_url(),
            bundled = race.launch.is_some(),
            "waiting for application to become ready"
        );

        tokio::spawn(async move {
            let outcome = race.run().await;
            match &outcome {
                ReadinessOutcome::Ready => info!("application is ready"),
                ReadinessOutcome::ProcessExited(code) => {
                    error!(code, "application exited before becoming ready");
                }
                ReadinessOutcome::ProcessSpawnError(message) => {
                    error!(error = %message, "application could not be launched");
                }
                ReadinessOutcome::TimedOut(limit) => {
                    error!(timeout_ms = limit.as_millis(), "application never became ready");
                }
            }
            tx.send_replace(Some(outcome));
        });

        *gate = Some(rx.clone());
        rx
    }
}

/// Inputs of the single readiness race.
struct Race {
    client: reqwest::Client,
    supervisor: Arc<ProcessSupervisor>,
    attempts: Arc<AtomicU64>,
    config: ProxyConfig,
    launch: Option<AppLaunchSpec>,
}

impl Race {
    async fn run(self) -> ReadinessOutcome {
        let poll = async {
            match self.config.alive_timeout {
                Some(limit) => tokio::time::timeout(limit, self.poll_until_alive())
                    .await
                    .map_or(ReadinessOutcome::TimedOut(limit), |()| ReadinessOutcome::Ready),
                None => {
                    self.poll_until_alive().await;
                    ReadinessOutcome::Ready
                }
            }
        };

        let exited = async {
            match self.launch.as_ref() {
                Some(spec) => self.supervisor.spawn_once(spec).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = poll => outcome,
            process = exited => process.into(),
        }
    }

    async fn poll_until_alive(&self) {
        let url = self.config.alive_url();
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => debug!(attempt, status = %resp.status(), "application not ready"),
                Err(e) => debug!(attempt, error = %e, "application not reachable"),
            }
            tokio::time::sleep(self.config.alive_delay).await;
        }
    }
}
