//! Discovery and reconciliation.
//!
//! Brings the registry in line with the container runtime. Two triggers
//! feed one reconciliation routine:
//!
//! ```text
//!  periodic sweep (30s) ──┐
//!                         ├──▶ sweep() ──▶ reconcile_container() ──▶ insert_if_absent
//!  `start` event ─────────┘
//!
//!  `stop`/`die`/`kill`/`destroy` event ──▶ retire_session()
//!  validation sweep (60s) ──────────────▶ retire_session()
//! ```
//!
//! Reconciliation gathers everything it needs (inspect data, the session
//! config file, network setup) without holding the registry lock and only
//! takes the write lock to commit, re-checking absence. Racing triggers
//! therefore produce exactly one registry entry.
//!
//! # Panic-Free Guarantees
//!
//! A failed iteration of any loop is logged and the loop continues with the
//! next tick. A dropped event stream is resubscribed after a delay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fork_core::{labels, network_name, Session, SessionId};
use fork_protocol::RefreshStatus;

use crate::proxy::ProxyConfigurator;
use crate::registry::{Registry, RegistryError, RemovalReason};
use crate::runtime::{ContainerInfo, ContainerRuntime, EventAction, LifecycleEvent, RuntimeError};

mod services;

pub use services::{
    from_config_file, from_labels, parse_config, resolve_services, ResolvedServices, ServiceSource,
};

/// Interval of the periodic discovery sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of the validation sweep.
pub const VALIDATION_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before resubscribing to a dropped event stream.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Metadata key recording which tier produced a session's services.
pub const SERVICE_SOURCE_KEY: &str = "service_source";

/// Errors from discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("service resolution task failed: {0}")]
    Join(String),
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// New sessions inserted
    pub discovered: u32,
    /// Known sessions refreshed
    pub refreshed: u32,
    /// Containers skipped (not running or unlabeled)
    pub skipped: u32,
    /// Containers whose reconciliation failed
    pub failed: u32,
}

/// Counters from a full refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub discovered: u32,
    pub failed: u32,
    pub removed: u32,
}

/// Result of reconciling one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    /// The session already existed and was touched
    AlreadyKnown,
    /// Not running, or no session label
    Ignored,
}

struct DiscoveryInner {
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: ProxyConfigurator,
    label_filter: String,
}

/// Shared handle to the discovery service.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryService {
    pub fn new(
        registry: Registry,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: ProxyConfigurator,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                registry,
                runtime,
                proxy,
                label_filter: labels::marker_filter(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn proxy(&self) -> &ProxyConfigurator {
        &self.inner.proxy
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Lists every marked container and reconciles each one.
    ///
    /// Applies the proxy configuration if at least one session was added.
    pub async fn sweep(&self) -> Result<SweepReport, DiscoveryError> {
        let containers = self
            .inner
            .runtime
            .list_containers(&self.inner.label_filter)
            .await?;

        let mut report = SweepReport::default();
        for container in &containers {
            match self.reconcile_container(container).await {
                Ok(ReconcileOutcome::Inserted) => report.discovered += 1,
                Ok(ReconcileOutcome::AlreadyKnown) => report.refreshed += 1,
                Ok(ReconcileOutcome::Ignored) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(container_id = %container.id, error = %e, "Failed to reconcile container");
                }
            }
        }

        if report.discovered > 0 {
            self.update_proxy().await;
        }

        debug!(
            containers = containers.len(),
            discovered = report.discovered,
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            "Discovery sweep complete"
        );
        Ok(report)
    }

    /// Reconciles one observed container against the registry.
    ///
    /// Does not apply the proxy configuration; callers batch that.
    pub async fn reconcile_container(
        &self,
        container: &ContainerInfo,
    ) -> Result<ReconcileOutcome, DiscoveryError> {
        if !container.state.is_running() {
            return Ok(ReconcileOutcome::Ignored);
        }
        let Some(session_id) = container.session_id() else {
            debug!(container_id = %container.id, "Container has no session label, skipping");
            return Ok(ReconcileOutcome::Ignored);
        };

        if self.inner.registry.contains(&session_id).await {
            match self
                .inner
                .registry
                .touch(&session_id, Some(&container.id))
                .await
            {
                Ok(_) => return Ok(ReconcileOutcome::AlreadyKnown),
                // Removed concurrently; reconcile it as new.
                Err(RegistryError::SessionNotFound(_)) => {}
            }
        }

        // Gather without holding the registry lock.
        let workdir = container.workdir();
        let container_labels = container.labels.clone();
        let resolved = tokio::task::spawn_blocking(move || {
            resolve_services(workdir.as_deref(), &container_labels)
        })
        .await
        .map_err(|e| DiscoveryError::Join(e.to_string()))?;

        debug!(
            session_id = %session_id,
            source = %resolved.source,
            services = resolved.services.len(),
            "Resolved session services"
        );

        let mut session = Session::new(session_id.clone(), container.project())
            .with_container(container.id.clone())
            .with_services(resolved.services)
            .with_metadata(SERVICE_SOURCE_KEY, resolved.source.as_str());
        if let Some(workdir) = container.workdir() {
            session = session.with_workdir(workdir);
        }
        if !container.name.is_empty() {
            session = session.with_metadata("container_name", container.name.clone());
        }

        self.attach_network(&session_id).await;

        // Commit: re-checks absence under the write lock.
        if self.inner.registry.insert_if_absent(session).await {
            Ok(ReconcileOutcome::Inserted)
        } else {
            Ok(ReconcileOutcome::AlreadyKnown)
        }
    }

    /// Handles one lifecycle event.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<(), DiscoveryError> {
        match event.action {
            EventAction::Start => {
                debug!(container_id = %event.container_id, "Container started, sweeping");
                self.sweep().await?;
            }
            action if action.ends_session() => {
                let Some(session_id) = self.session_for_event(&event).await else {
                    debug!(container_id = %event.container_id, "Event for unknown session");
                    return Ok(());
                };
                let reason = if action == EventAction::Remove {
                    RemovalReason::ContainerMissing
                } else {
                    RemovalReason::ContainerStopped
                };
                match self.retire_session(&session_id, reason).await {
                    Ok(_) => {}
                    // Already gone through another path
                    Err(RegistryError::SessionNotFound(_)) => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Removes sessions whose backing container is no longer running.
    ///
    /// Sessions without a recorded container are left alone.
    pub async fn validate(&self) -> Result<u32, DiscoveryError> {
        let containers = self
            .inner
            .runtime
            .list_containers(&self.inner.label_filter)
            .await?;

        let running: Vec<&ContainerInfo> =
            containers.iter().filter(|c| c.state.is_running()).collect();
        let running_sessions: HashSet<SessionId> =
            running.iter().filter_map(|c| c.session_id()).collect();

        let mut removed = 0;
        for session in self.inner.registry.snapshot().await {
            if session.container_id.is_empty() || running_sessions.contains(&session.id) {
                continue;
            }
            if running
                .iter()
                .any(|c| same_container(&c.id, &session.container_id))
            {
                continue;
            }
            // Not labeled; ask the runtime about the recorded container.
            match self
                .inner
                .runtime
                .inspect_container(&session.container_id)
                .await
            {
                Ok(Some(info)) if info.state.is_running() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        container_id = %session.container_id,
                        error = %e,
                        "Failed to inspect backing container, keeping session"
                    );
                    continue;
                }
            }

            if self
                .retire_session_quiet(&session.id, RemovalReason::ContainerMissing)
                .await
            {
                removed += 1;
            }
        }

        if removed > 0 {
            self.update_proxy().await;
            info!(removed, "Validation removed stale sessions");
        }
        Ok(removed)
    }

    /// Re-checks one session against its backing container.
    pub async fn refresh_session(
        &self,
        session_id: &SessionId,
    ) -> Result<RefreshStatus, DiscoveryError> {
        let session = self.inner.registry.get(session_id).await?;

        let container = if session.container_id.is_empty() {
            self.inner
                .runtime
                .list_containers(&self.inner.label_filter)
                .await?
                .into_iter()
                .find(|c| c.session_id().as_ref() == Some(session_id))
        } else {
            self.inner
                .runtime
                .inspect_container(&session.container_id)
                .await?
        };

        match container {
            Some(info) if info.state.is_running() => {
                self.inner
                    .registry
                    .touch(session_id, Some(&info.id))
                    .await?;
                Ok(RefreshStatus::Updated)
            }
            // No backing container was ever recorded or labeled.
            None if session.container_id.is_empty() => {
                self.inner.registry.touch(session_id, None).await?;
                Ok(RefreshStatus::Updated)
            }
            _ => {
                self.retire_session(session_id, RemovalReason::ContainerStopped)
                    .await?;
                Ok(RefreshStatus::Removed)
            }
        }
    }

    /// Validation followed by a sweep.
    pub async fn refresh_all(&self) -> Result<RefreshReport, DiscoveryError> {
        let removed = self.validate().await?;
        let sweep = self.sweep().await?;
        Ok(RefreshReport {
            discovered: sweep.discovered,
            failed: sweep.failed,
            removed,
        })
    }

    // ========================================================================
    // Session lifecycle helpers shared with the server
    // ========================================================================

    /// Ensures the session network exists and the proxy is attached to it.
    ///
    /// Best-effort: failures are logged.
    pub async fn attach_network(&self, session_id: &SessionId) {
        let network = network_name(session_id);

        if let Err(e) = self.inner.runtime.ensure_network(&network).await {
            warn!(network = %network, error = %e, "Failed to ensure session network");
            return;
        }
        if let Err(e) = self.inner.proxy.control().connect_network(&network).await {
            debug!(network = %network, error = %e, "Failed to attach proxy to session network");
        }
    }

    /// Removes a session, writes the proxy configuration, and tears down
    /// the session network in the background.
    ///
    /// Returns once the configuration write has been attempted.
    pub async fn retire_session(
        &self,
        session_id: &SessionId,
        reason: RemovalReason,
    ) -> Result<Session, RegistryError> {
        let removed = self.inner.registry.remove(session_id, reason).await?;
        self.update_proxy().await;
        self.spawn_network_teardown(session_id);
        Ok(removed)
    }

    async fn retire_session_quiet(&self, session_id: &SessionId, reason: RemovalReason) -> bool {
        match self.inner.registry.remove(session_id, reason).await {
            Ok(_) => {
                self.spawn_network_teardown(session_id);
                true
            }
            Err(_) => false,
        }
    }

    async fn update_proxy(&self) {
        if let Err(e) = self.inner.proxy.apply().await {
            error!(error = %e, "Failed to apply proxy configuration");
        }
    }

    fn spawn_network_teardown(&self, session_id: &SessionId) {
        let network = network_name(session_id);
        let runtime = Arc::clone(&self.inner.runtime);
        let proxy = self.inner.proxy.clone();

        tokio::spawn(async move {
            if let Err(e) = proxy.control().disconnect_network(&network).await {
                debug!(network = %network, error = %e, "Failed to detach proxy from network");
            }
            match runtime.remove_network_if_unused(&network).await {
                Ok(true) => debug!(network = %network, "Session network removed"),
                Ok(false) => debug!(network = %network, "Session network kept"),
                Err(e) => warn!(network = %network, error = %e, "Failed to remove session network"),
            }
        });
    }

    async fn session_for_event(&self, event: &LifecycleEvent) -> Option<SessionId> {
        let snapshot = self.inner.registry.snapshot().await;

        if let Some(id) = event.session_id() {
            // Ignore late events from a container the session no longer uses.
            return snapshot
                .iter()
                .find(|s| s.id == id)
                .filter(|s| {
                    s.container_id.is_empty()
                        || same_container(&s.container_id, &event.container_id)
                })
                .map(|s| s.id.clone());
        }

        snapshot
            .iter()
            .find(|s| same_container(&s.container_id, &event.container_id))
            .map(|s| s.id.clone())
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Spawns the periodic discovery sweep.
    pub fn spawn_sweep_task(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.sweep().await {
                            error!(error = %e, "Discovery sweep failed");
                        }
                    }
                }
            }
            info!("Discovery sweep loop stopped");
        })
    }

    /// Spawns the periodic validation sweep.
    pub fn spawn_validation_task(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(VALIDATION_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate tick is skipped; startup already swept.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.validate().await {
                            error!(error = %e, "Validation sweep failed");
                        }
                    }
                }
            }
            info!("Validation loop stopped");
        })
    }

    /// Spawns the lifecycle-event subscription, resubscribing after drops.
    pub fn spawn_event_task(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this
                    .inner
                    .runtime
                    .subscribe_events(&this.inner.label_filter)
                    .await
                {
                    Ok(mut events) => {
                        info!("Subscribed to container events");
                        loop {
                            tokio::select! {
                                _ = cancel_token.cancelled() => {
                                    info!("Event loop stopped");
                                    return;
                                }
                                event = events.recv() => match event {
                                    Some(event) => {
                                        if let Err(e) = this.handle_event(event).await {
                                            error!(error = %e, "Failed to handle container event");
                                        }
                                    }
                                    None => {
                                        warn!(
                                            delay_secs = RESUBSCRIBE_DELAY.as_secs(),
                                            "Container event stream ended, resubscribing"
                                        );
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to subscribe to container events"),
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
            info!("Event loop stopped");
        })
    }
}

/// Compares container ids, accepting a short id against a full one.
fn same_container(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.starts_with(b) || b.starts_with(a))
}
