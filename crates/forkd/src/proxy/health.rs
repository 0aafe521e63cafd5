//! Proxy health checking and self-healing.
//!
//! Consecutive failed health checks past a threshold trigger a forced restart.
//! Restarts that keep failing put the monitor into a cooldown during which
//! no checks or restarts are attempted.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ProxyConfigurator;

/// How often the proxy health is checked.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Thresholds for the health monitor.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Consecutive failed checks before a restart
    pub failure_threshold: u32,
    /// Consecutive restart failures before cooling down
    pub restart_failure_limit: u32,
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            restart_failure_limit: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// What one health tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Healthy,
    /// Check failed but the threshold was not reached
    Degraded { failures: u32 },
    Restarted,
    RestartFailed { failures: u32 },
    CoolingDown,
}

/// Health state machine over a configurator.
pub struct HealthMonitor {
    configurator: ProxyConfigurator,
    policy: HealthPolicy,
    failed_checks: u32,
    restart_failures: u32,
    cooldown_until: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(configurator: ProxyConfigurator) -> Self {
        Self::with_policy(configurator, HealthPolicy::default())
    }

    pub fn with_policy(configurator: ProxyConfigurator, policy: HealthPolicy) -> Self {
        Self {
            configurator,
            policy,
            failed_checks: 0,
            restart_failures: 0,
            cooldown_until: None,
        }
    }

    /// Runs one health check and, when warranted, one restart.
    pub async fn tick(&mut self) -> HealthAction {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                debug!("Proxy health in cooldown");
                return HealthAction::CoolingDown;
            }
            info!("Proxy restart cooldown over");
            self.cooldown_until = None;
            self.restart_failures = 0;
        }

        match self.configurator.control().check_health().await {
            Ok(()) => {
                if self.failed_checks > 0 {
                    info!(
                        previous_failures = self.failed_checks,
                        "Proxy healthy again"
                    );
                }
                self.failed_checks = 0;
                return HealthAction::Healthy;
            }
            Err(e) => {
                self.failed_checks += 1;
                warn!(
                    failures = self.failed_checks,
                    threshold = self.policy.failure_threshold,
                    error = %e,
                    "Proxy health check failed"
                );
            }
        }

        if self.failed_checks < self.policy.failure_threshold {
            return HealthAction::Degraded {
                failures: self.failed_checks,
            };
        }

        match self.configurator.restart_proxy().await {
            Ok(outcome) => {
                info!(reload = ?outcome, "Proxy recovered by restart");
                self.failed_checks = 0;
                self.restart_failures = 0;
                HealthAction::Restarted
            }
            Err(e) => {
                self.restart_failures += 1;
                error!(
                    failures = self.restart_failures,
                    error = %e,
                    "Proxy restart failed"
                );
                if self.restart_failures >= self.policy.restart_failure_limit {
                    error!(
                        cooldown_secs = self.policy.cooldown.as_secs(),
                        "Proxy restarts keep failing, cooling down"
                    );
                    self.cooldown_until = Some(Instant::now() + self.policy.cooldown);
                }
                HealthAction::RestartFailed {
                    failures: self.restart_failures,
                }
            }
        }
    }
}

/// Spawns the periodic health loop.
pub fn spawn_health_task(
    mut monitor: HealthMonitor,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the proxy was just started.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let action = monitor.tick().await;
                    debug!(action = ?action, "Proxy health tick");
                }
            }
        }

        info!("Proxy health loop stopped");
    })
}
