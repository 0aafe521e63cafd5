//! Shared test doubles for the container runtime and the proxy.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::sleep;

use fork_core::labels;
use forkd::discovery::DiscoveryService;
use forkd::proxy::{ProxyConfigurator, ProxyControl, ReloadPolicy};
use forkd::registry::Registry;
use forkd::runtime::{
    ContainerInfo, ContainerRuntime, ContainerState, EventAction, EventStream, LifecycleEvent,
    RuntimeError,
};

pub const DOMAIN: &str = "localhost";

// ============================================================================
// Fake container runtime
// ============================================================================

/// In-memory container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerInfo>>,
    networks: Mutex<BTreeSet<String>>,
    removed_networks: Mutex<Vec<String>>,
    event_tx: Mutex<Option<mpsc::Sender<LifecycleEvent>>>,
    subscriptions: AtomicU32,
    fail_list: AtomicBool,
    fail_inspect: Mutex<BTreeSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_container(&self, info: ContainerInfo) {
        self.containers.lock().unwrap().push(info);
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        for c in self.containers.lock().unwrap().iter_mut() {
            if c.id == id {
                c.state = state;
            }
        }
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Makes `inspect_container` fail for one id.
    pub fn fail_inspect(&self, id: &str) {
        self.fail_inspect.lock().unwrap().insert(id.to_string());
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().unwrap().iter().cloned().collect()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        self.removed_networks.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Sends an event to the current subscriber.
    pub async fn emit(&self, event: LifecycleEvent) {
        let tx = self.event_tx.lock().unwrap().clone();
        tx.expect("no event subscriber").send(event).await.unwrap();
    }

    /// Ends the current event stream.
    pub fn close_events(&self) {
        self.event_tx.lock().unwrap().take();
    }
}

fn matches_filter(info: &ContainerInfo, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => info.label(key) == Some(value),
        None => info.labels.contains_key(filter),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("runtime down".into()));
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches_filter(c, label_filter))
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        if self.fail_inspect.lock().unwrap().contains(id) {
            return Err(RuntimeError::Unavailable(format!("inspect {id} failed")));
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id.starts_with(id))
            .cloned())
    }

    async fn subscribe_events(&self, _label_filter: &str) -> Result<EventStream, RuntimeError> {
        let (tx, rx) = mpsc::channel(16);
        *self.event_tx.lock().unwrap() = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_network_if_unused(&self, name: &str) -> Result<bool, RuntimeError> {
        let removed = self.networks.lock().unwrap().remove(name);
        if removed {
            self.removed_networks.lock().unwrap().push(name.to_string());
        }
        Ok(removed)
    }
}

/// A running, marked container for `session` in `project`.
pub fn container(id: &str, session: &str, project: &str) -> ContainerInfo {
    let mut labels = HashMap::new();
    labels.insert(labels::MANAGED.to_string(), labels::MANAGED_VALUE.to_string());
    labels.insert(labels::SESSION.to_string(), session.to_string());
    labels.insert(labels::PROJECT.to_string(), project.to_string());
    ContainerInfo {
        id: id.to_string(),
        name: format!("{project}-{session}"),
        state: ContainerState::Running,
        labels,
    }
}

/// A lifecycle event carrying the session label.
pub fn event(action: EventAction, container_id: &str, session: &str) -> LifecycleEvent {
    let mut attributes = HashMap::new();
    attributes.insert(labels::SESSION.to_string(), session.to_string());
    LifecycleEvent {
        action,
        container_id: container_id.to_string(),
        attributes,
    }
}

// ============================================================================
// Fake proxy
// ============================================================================

/// In-memory proxy process.
#[derive(Default)]
pub struct FakeProxy {
    running: AtomicBool,
    fail_reload: AtomicBool,
    fail_health: AtomicBool,
    fail_restart: AtomicBool,
    reload_attempts: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    restarts: AtomicU32,
    networks: Mutex<BTreeSet<String>>,
}

impl FakeProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn running() -> Arc<Self> {
        let proxy = Self::default();
        proxy.running.store(true, Ordering::SeqCst);
        Arc::new(proxy)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    pub fn reload_attempts(&self) -> u32 {
        self.reload_attempts.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().unwrap().iter().cloned().collect()
    }

    pub fn forget_networks(&self) {
        self.networks.lock().unwrap().clear();
    }

    fn failure(what: &str) -> RuntimeError {
        RuntimeError::Command {
            command: format!("fake {what}"),
            stderr: format!("{what} failed"),
        }
    }
}

#[async_trait]
impl ProxyControl for FakeProxy {
    async fn is_running(&self) -> Result<bool, RuntimeError> {
        Ok(self.is_up())
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(Self::failure("start"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_running(false);
        Ok(())
    }

    async fn remove(&self) -> Result<(), RuntimeError> {
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(Self::failure("remove"));
        }
        self.set_running(false);
        self.forget_networks();
        Ok(())
    }

    async fn reload(&self) -> Result<(), RuntimeError> {
        self.reload_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(Self::failure("reload"));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), RuntimeError> {
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(Self::failure("restart"));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.set_running(true);
        Ok(())
    }

    async fn check_health(&self) -> Result<(), RuntimeError> {
        if !self.is_up() || self.fail_health.load(Ordering::SeqCst) {
            return Err(Self::failure("health"));
        }
        Ok(())
    }

    async fn connect_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.networks.lock().unwrap().insert(network.to_string());
        Ok(())
    }

    async fn disconnect_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.networks.lock().unwrap().remove(network);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Registry, configurator and discovery wired to the fakes.
pub struct Harness {
    pub dir: TempDir,
    pub registry: Registry,
    pub runtime: Arc<FakeRuntime>,
    pub control: Arc<FakeProxy>,
    pub proxy: ProxyConfigurator,
    pub discovery: DiscoveryService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_proxy(FakeProxy::running())
    }

    pub fn with_proxy(control: Arc<FakeProxy>) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let registry = Registry::new();
        let runtime = FakeRuntime::new();
        let proxy = ProxyConfigurator::with_reload_policy(
            registry.clone(),
            control.clone(),
            dir.path().join("proxy").join("default.conf"),
            DOMAIN,
            ReloadPolicy {
                attempts: 3,
                delay: Duration::ZERO,
            },
        );
        let discovery = DiscoveryService::new(registry.clone(), runtime.clone(), proxy.clone());

        Self {
            dir,
            registry,
            runtime,
            control,
            proxy,
            discovery,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.proxy.config_path().to_path_buf()
    }

    /// Current on-disk proxy configuration, empty if not written yet.
    pub fn config_text(&self) -> String {
        std::fs::read_to_string(self.config_path()).unwrap_or_default()
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
