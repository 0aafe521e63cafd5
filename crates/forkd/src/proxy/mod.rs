//! Reverse-proxy configurator.
//!
//! Keeps the proxy's on-disk configuration consistent with the registry and
//! keeps the proxy process itself alive.
//!
//! # Architecture
//!
//! ```text
//!  register / unregister / reconcile
//!                 │
//!                 ▼
//!   ┌──────────────────────────┐  render  ┌────────────────────────────┐
//!   │ ProxyConfigurator::apply │─────────▶│ <state>/proxy/default.conf │
//!   └────────────┬─────────────┘  atomic  └────────────────────────────┘
//!                │ spawn
//!                ▼
//!   ┌──────────────────────────┐
//!   │ reload cycle             │  connect session networks,
//!   │ (bounded retries)        │  then `nginx -s reload`
//!   └──────────────────────────┘
//! ```
//!
//! The file write is independent of reload success. A failed reload leaves
//! the last written file in place; the next apply retries.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fork_core::{network_name, Session};

use crate::atomic::write_atomic;
use crate::registry::Registry;
use crate::runtime::RuntimeError;

mod control;
mod health;
mod render;

pub use control::{DockerProxy, ProxyControl};
pub use health::{
    spawn_health_task, HealthAction, HealthMonitor, HealthPolicy, HEALTH_INTERVAL,
};
pub use render::{render, virtual_hosts, VirtualHost, HEALTH_PATH};

/// Errors from applying the proxy configuration.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to write proxy config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("proxy config writer task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Bounded retry policy for reloads.
#[derive(Debug, Clone, Copy)]
pub struct ReloadPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Result of one reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded { attempts: u32 },
    /// The proxy is not running; it reads the file when it starts.
    Skipped,
    Failed { attempts: u32 },
}

struct ConfiguratorInner {
    registry: Registry,
    control: Arc<dyn ProxyControl>,
    config_path: PathBuf,
    domain: String,
    policy: ReloadPolicy,
    /// Serializes render + write
    apply_lock: Mutex<()>,
    /// Serializes reload cycles
    reload_lock: Mutex<()>,
    last_rendered: Mutex<Option<String>>,
}

/// Shared handle to the proxy configurator.
#[derive(Clone)]
pub struct ProxyConfigurator {
    inner: Arc<ConfiguratorInner>,
}

impl ProxyConfigurator {
    pub fn new(
        registry: Registry,
        control: Arc<dyn ProxyControl>,
        config_path: impl Into<PathBuf>,
        domain: impl Into<String>,
    ) -> Self {
        Self::with_reload_policy(registry, control, config_path, domain, ReloadPolicy::default())
    }

    pub fn with_reload_policy(
        registry: Registry,
        control: Arc<dyn ProxyControl>,
        config_path: impl Into<PathBuf>,
        domain: impl Into<String>,
        policy: ReloadPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ConfiguratorInner {
                registry,
                control,
                config_path: config_path.into(),
                domain: domain.into(),
                policy,
                apply_lock: Mutex::new(()),
                reload_lock: Mutex::new(()),
                last_rendered: Mutex::new(None),
            }),
        }
    }

    /// Path of the rendered configuration file.
    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    pub fn control(&self) -> &Arc<dyn ProxyControl> {
        &self.inner.control
    }

    /// Content of the last successful write, if any.
    pub async fn last_rendered(&self) -> Option<String> {
        self.inner.last_rendered.lock().await.clone()
    }

    /// Renders and writes the configuration, then schedules a reload.
    ///
    /// Returns once the write has been attempted; the reload runs in the
    /// background with the bounded retry policy.
    pub async fn apply(&self) -> Result<JoinHandle<ReloadOutcome>, ProxyError> {
        self.write_current().await?;

        let this = self.clone();
        Ok(tokio::spawn(async move { this.reload_cycle().await }))
    }

    /// Renders, writes and reloads, waiting for the reload cycle.
    pub async fn apply_and_wait(&self) -> Result<ReloadOutcome, ProxyError> {
        self.write_current().await?;
        Ok(self.reload_cycle().await)
    }

    /// Renders the registry contents and writes them atomically.
    pub async fn write_current(&self) -> Result<(), ProxyError> {
        let _guard = self.inner.apply_lock.lock().await;

        let sessions = self.inner.registry.snapshot().await;
        let rendered = render(&sessions, &self.inner.domain);
        self.write_file(rendered).await
    }

    /// Starts the proxy and applies the current configuration.
    pub async fn start_proxy(&self) -> Result<ReloadOutcome, ProxyError> {
        self.write_current().await?;
        self.inner.control.start().await?;
        info!(path = %self.inner.config_path.display(), "Proxy started");
        Ok(self.reload_cycle().await)
    }

    /// Force-restarts the proxy, then reapplies the last configuration and
    /// reattaches every session network.
    pub async fn restart_proxy(&self) -> Result<ReloadOutcome, ProxyError> {
        if let Err(e) = self.inner.control.restart().await {
            warn!(error = %e, "Proxy restart failed, recreating container");
            self.inner.control.remove().await?;
            self.inner.control.start().await?;
        }
        warn!("Proxy restarted");

        let last = self.last_rendered().await;
        match last {
            Some(rendered) => {
                let _guard = self.inner.apply_lock.lock().await;
                self.write_file(rendered).await?;
            }
            None => self.write_current().await?,
        }

        Ok(self.reload_cycle().await)
    }

    /// Stops the proxy, logging instead of failing.
    pub async fn stop_proxy(&self) {
        match self.inner.control.stop().await {
            Ok(()) => info!("Proxy stopped"),
            Err(e) => warn!(error = %e, "Failed to stop proxy"),
        }
    }

    /// Attaches the proxy to every session's network.
    ///
    /// Failures are logged per network and do not stop the pass.
    pub async fn connect_session_networks(&self, sessions: &[Session]) -> usize {
        let mut connected = 0;
        for session in sessions {
            let network = network_name(&session.id);
            match self.inner.control.connect_network(&network).await {
                Ok(()) => connected += 1,
                Err(e) => debug!(
                    network = %network,
                    session_id = %session.id,
                    error = %e,
                    "Could not attach proxy to session network"
                ),
            }
        }
        connected
    }

    /// Runs one reload cycle: skip if the proxy is down, otherwise attach
    /// session networks and reload with bounded retries.
    pub async fn reload_cycle(&self) -> ReloadOutcome {
        let _guard = self.inner.reload_lock.lock().await;

        match self.inner.control.is_running().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Proxy not running, skipping reload");
                return ReloadOutcome::Skipped;
            }
            Err(e) => {
                warn!(error = %e, "Could not query proxy state, skipping reload");
                return ReloadOutcome::Skipped;
            }
        }

        let sessions = self.inner.registry.snapshot().await;
        self.connect_session_networks(&sessions).await;

        self.reload_with_retry().await
    }

    async fn reload_with_retry(&self) -> ReloadOutcome {
        let ReloadPolicy { attempts, delay } = self.inner.policy;
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            match self.inner.control.reload().await {
                Ok(()) => {
                    debug!(attempt, "Proxy reloaded");
                    return ReloadOutcome::Reloaded { attempts: attempt };
                }
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "Proxy reload failed");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            attempts,
            "Proxy reload failed on every attempt, giving up until the next update"
        );
        ReloadOutcome::Failed { attempts }
    }

    async fn write_file(&self, rendered: String) -> Result<(), ProxyError> {
        let path = self.inner.config_path.clone();
        let bytes = rendered.clone().into_bytes();

        tokio::task::spawn_blocking(move || {
            write_atomic(&path, &bytes).map_err(|source| ProxyError::Write { path, source })
        })
        .await
        .map_err(|e| ProxyError::Join(e.to_string()))??;

        debug!(
            path = %self.inner.config_path.display(),
            bytes = rendered.len(),
            "Proxy config written"
        );
        *self.inner.last_rendered.lock().await = Some(rendered);
        Ok(())
    }
}
