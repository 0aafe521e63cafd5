//! Daemon assembly and lifecycle.
//!
//! One `Daemon` owns the registry, the counter store, the proxy
//! configurator, discovery and the singleton guard. `run` performs the
//! startup sequence, serves until the cancellation token fires, then shuts
//! everything down:
//!
//! 1. singleton check (another live daemon aborts startup)
//! 2. bind the control socket (failure aborts startup)
//! 3. initial discovery sweep
//! 4. start the proxy with the current configuration
//! 5. spawn guard, sweep, validation, event and health loops
//! 6. serve clients
//! 7. flush state, stop the proxy, remove the socket, release the PID record
//!
//! A daemon stopped because another live daemon holds the PID record skips
//! step 7 except for removing its own PID entry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::discovery::DiscoveryService;
use crate::proxy::{spawn_health_task, DockerProxy, HealthMonitor, ProxyConfigurator, ProxyControl};
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, DockerCli, DockerRuntime};
use crate::server::{DaemonServer, ServerContext, ServerError};
use crate::singleton::{spawn_guard_task, GuardError, GuardStatus, SingletonGuard};
use crate::store::StateStore;

/// How long shutdown waits for background loops to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that abort the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another daemon is already running (PID {0})")]
    AlreadyRunning(u32),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// The daemon instance.
pub struct Daemon {
    config: DaemonConfig,
    registry: Registry,
    store: StateStore,
    proxy: ProxyConfigurator,
    discovery: DiscoveryService,
    guard: Arc<SingletonGuard>,
}

impl Daemon {
    /// Builds a daemon backed by the docker CLI.
    pub fn new(config: DaemonConfig) -> Self {
        let cli = DockerCli::new(config.docker_bin.clone());
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(cli.clone()));
        let control: Arc<dyn ProxyControl> = Arc::new(DockerProxy::new(cli, config.proxy.clone()));
        Self::with_backends(config, runtime, control)
    }

    /// Builds a daemon over explicit runtime and proxy backends.
    pub fn with_backends(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ProxyControl>,
    ) -> Self {
        let registry = Registry::new();
        let store = StateStore::load(config.state_file());
        let proxy = ProxyConfigurator::new(
            registry.clone(),
            control,
            config.proxy.config_path(),
            config.domain.clone(),
        );
        let discovery = DiscoveryService::new(registry.clone(), runtime, proxy.clone());
        let guard = Arc::new(SingletonGuard::for_current_process(config.pid_file()));

        Self {
            config,
            registry,
            store,
            proxy,
            discovery,
            guard,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn proxy(&self) -> &ProxyConfigurator {
        &self.proxy
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    /// Runs the daemon until `cancel_token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::AlreadyRunning` if another live daemon holds
    /// the PID record, and `DaemonError::Server` if the socket cannot be
    /// bound. In both cases nothing was started.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<(), DaemonError> {
        if let GuardStatus::Superseded { holder } = self.guard.check()? {
            return Err(DaemonError::AlreadyRunning(holder));
        }

        let server = DaemonServer::new(
            &self.config.socket_path,
            ServerContext::new(
                self.registry.clone(),
                self.store.clone(),
                self.discovery.clone(),
            ),
            cancel_token.clone(),
        );
        let listener = match server.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.release_guard();
                return Err(e.into());
            }
        };

        match self.discovery.sweep().await {
            Ok(report) => info!(
                discovered = report.discovered,
                failed = report.failed,
                "Initial session discovery complete"
            ),
            Err(e) => warn!(error = %e, "Initial discovery failed"),
        }

        match self.proxy.start_proxy().await {
            Ok(outcome) => info!(reload = ?outcome, "Proxy ready"),
            Err(e) => error!(error = %e, "Failed to start proxy, health loop will retry"),
        }

        let guard_task = spawn_guard_task(Arc::clone(&self.guard), cancel_token.clone());
        let handles = vec![
            self.discovery.spawn_sweep_task(cancel_token.clone()),
            self.discovery.spawn_validation_task(cancel_token.clone()),
            self.discovery.spawn_event_task(cancel_token.clone()),
            spawn_health_task(HealthMonitor::new(self.proxy.clone()), cancel_token.clone()),
        ];
        let sessions = self.registry.len().await;
        info!(sessions, "Daemon started");

        server.serve(listener).await;

        let status = match tokio::time::timeout(SHUTDOWN_GRACE, guard_task).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(error = %e, "Singleton guard task failed");
                GuardStatus::Sole
            }
            Err(_) => {
                warn!("Singleton guard did not stop in time");
                GuardStatus::Sole
            }
        };
        self.join_tasks(handles).await;

        match status {
            GuardStatus::Sole => self.shutdown(&server).await,
            GuardStatus::Superseded { holder } => self.yield_to(holder),
        }
        Ok(())
    }

    async fn join_tasks(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }
    }

    /// Cooperative shutdown of the only daemon: flush state, stop the
    /// proxy, remove the socket and release the PID record.
    async fn shutdown(&self, server: &DaemonServer) {
        info!("Daemon shutting down");

        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Failed to flush counter state");
        }

        self.proxy.stop_proxy().await;
        server.remove_socket();
        self.release_guard();

        info!("Daemon stopped");
    }

    /// Exit path when another daemon won: the proxy, counter state and
    /// socket now belong to it, so only our PID entry is touched.
    fn yield_to(&self, holder: u32) {
        warn!(holder, "Daemon superseded, exiting without touching shared state");
        self.release_guard();
        info!("Daemon stopped");
    }

    fn release_guard(&self) {
        if let Err(e) = self.guard.release() {
            warn!(error = %e, "Failed to release PID record");
        }
    }
}
