//! Process-wide state shared by every invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ProxyOverrides, SidecarConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::readiness::{ReadinessCoordinator, ReadinessState};
use crate::supervisor::{absolute_dir, AppLaunchSpec, ProcessSupervisor};

/// Progress of the one bundle install a sidecar accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LaunchSlot {
    /// No bundle yet.
    Empty,
    /// An `init` is unpacking a bundle.
    Reserved,
    /// The bundle is installed.
    Recorded(AppLaunchSpec),
}

/// State living for the whole sidecar lifetime.
///
/// `ProxyConfig` is shared and mutable: overrides carried by any `run` call
/// apply to every later call too, and the last writer wins. The same holds
/// for `__ow_proxy_env_*` variables, which are kept here and handed to the
/// application when it is launched.
#[derive(Debug)]
pub struct ProxyState {
    proxy: RwLock<ProxyConfig>,
    env: RwLock<BTreeMap<String, String>>,
    app_dir: PathBuf,
    launch: Mutex<LaunchSlot>,
    supervisor: Arc<ProcessSupervisor>,
    readiness: ReadinessCoordinator,
    client: reqwest::Client,
}

impl ProxyState {
    /// Build the shared state from the startup configuration.
    pub fn new(config: &SidecarConfig) -> ProxyResult<Self> {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let readiness = ReadinessCoordinator::new(supervisor.clone())?;

        // No timeout: a slow application is allowed to take as long as it needs
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::server(format!("failed to create client: {e}")))?;

        Ok(Self {
            proxy: RwLock::new(config.proxy.clone()),
            env: RwLock::new(BTreeMap::new()),
            app_dir: absolute_dir(config.app.dir.clone())?,
            launch: Mutex::new(LaunchSlot::Empty),
            supervisor,
            readiness,
            client,
        })
    }

    /// Snapshot of the current target configuration.
    pub fn proxy_config(&self) -> ProxyConfig {
        self.proxy.read().clone()
    }

    /// Apply overrides to the shared configuration and return the result.
    pub fn apply_overrides(&self, overrides: &ProxyOverrides) -> ProxyConfig {
        if overrides.is_empty() {
            return self.proxy_config();
        }

        let mut proxy = self.proxy.write();
        if proxy.apply_overrides(overrides) {
            info!(target_url = %proxy.base_url(), "proxy configuration overridden");
        }
        proxy.clone()
    }

    /// Remember environment variables for the application.
    ///
    /// Names a process environment cannot hold are skipped.
    pub fn record_env(&self, vars: &[(String, String)]) {
        if vars.is_empty() {
            return;
        }

        let mut env = self.env.write();
        for (name, value) in vars {
            if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
                warn!(name = %name, "skipping invalid environment variable");
                continue;
            }
            debug!(name = %name, "environment variable recorded");
            env.insert(name.clone(), value.clone());
        }
    }

    /// Environment variables recorded by `run` calls so far.
    pub fn recorded_env(&self) -> BTreeMap<String, String> {
        self.env.read().clone()
    }

    /// Directory bundles are extracted into, always absolute.
    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// Launch spec recorded by `init`, if any.
    pub fn launch_spec(&self) -> Option<AppLaunchSpec> {
        match &*self.launch.lock() {
            LaunchSlot::Recorded(spec) => Some(spec.clone()),
            LaunchSlot::Empty | LaunchSlot::Reserved => None,
        }
    }

    /// Claim the right to install a bundle.
    ///
    /// Only one claim ever succeeds, and none once readiness was asked for:
    /// the readiness decision is final and would ignore a later bundle.
    pub fn reserve_launch(&self) -> ProxyResult<()> {
        let mut slot = self.launch.lock();
        if *slot != LaunchSlot::Empty {
            return Err(ProxyError::forbidden(
                "cannot initialize the action more than once",
            ));
        }
        if self.readiness().state() != ReadinessState::NotStarted {
            return Err(ProxyError::forbidden(
                "cannot initialize the action after it started running",
            ));
        }
        *slot = LaunchSlot::Reserved;
        Ok(())
    }

    /// Record the launch spec of the bundle installed under a reservation.
    pub fn record_launch(&self, spec: AppLaunchSpec) {
        *self.launch.lock() = LaunchSlot::Recorded(spec);
    }

    /// Give up a reservation after a failed install.
    pub fn release_launch(&self) {
        let mut slot = self.launch.lock();
        if *slot == LaunchSlot::Reserved {
            *slot = LaunchSlot::Empty;
        }
    }

    /// Process supervisor.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Readiness coordinator.
    pub fn readiness(&self) -> &ReadinessCoordinator {
        &self.readiness
    }

    /// Outbound HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Wait until the application serves, launching it first if bundled.
    ///
    /// Fails with 503 while an `init` is still unpacking its bundle.
    pub async fn ensure_ready(&self, config: &ProxyConfig) -> ProxyResult<()> {
        let rx = {
            let slot = self.launch.lock();
            let launch = match &*slot {
                LaunchSlot::Empty => None,
                LaunchSlot::Reserved => {
                    return Err(ProxyError::unavailable("the action is still initializing"));
                }
                LaunchSlot::Recorded(spec) => Some(self.with_recorded_env(spec)),
            };
            self.readiness.start(config, launch.as_ref())
        };
        ReadinessCoordinator::wait(rx).await
    }

    /// `spec` with recorded variables layered over its own.
    fn with_recorded_env(&self, spec: &AppLaunchSpec) -> AppLaunchSpec {
        let recorded = self.env.read();
        let mut env = spec.env.clone();
        env.retain(|(name, _)| !recorded.contains_key(name));
        env.extend(recorded.iter().map(|(k, v)| (k.clone(), v.clone())));
        spec.clone().with_env(env)
    }
}
