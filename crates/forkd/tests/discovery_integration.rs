//! Integration tests for container discovery against a fake runtime.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fork_core::{labels, Service, Session, SessionId};
use fork_protocol::RefreshStatus;
use forkd::discovery::{DiscoveryError, SERVICE_SOURCE_KEY};
use forkd::runtime::{ContainerState, EventAction};

use common::{container, event, wait_until, Harness};

fn id(s: &str) -> SessionId {
    SessionId::new(s)
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn test_sweep_uses_default_service_without_config_or_labels() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));

    let report = h.discovery.sweep().await.unwrap();
    assert_eq!(report.discovered, 1);

    let session = h.registry.get(&id("abc")).await.unwrap();
    assert_eq!(session.services, vec![Service::new("web", 3000)]);
    assert_eq!(
        session.metadata.get(SERVICE_SOURCE_KEY).map(String::as_str),
        Some("default")
    );
    assert_eq!(session.container_id, "c1");

    let config = h.config_text();
    assert!(config.contains("server_name web.demo-abc.localhost;"));
    assert!(config.contains("set $upstream demo-abc:3000;"));
}

#[tokio::test]
async fn test_sweep_reads_service_labels() {
    let h = Harness::new();
    let mut info = container("c1", "abc", "demo");
    info.labels
        .insert("dev.fork.service.api.port".into(), "4000".into());
    info.labels
        .insert("dev.fork.service.api.subdomain".into(), "backend".into());
    info.labels
        .insert("dev.fork.service.broken.port".into(), "nope".into());
    h.runtime.add_container(info);

    h.discovery.sweep().await.unwrap();

    let session = h.registry.get(&id("abc")).await.unwrap();
    assert_eq!(
        session.services,
        vec![Service::new("api", 4000).with_subdomain("backend")]
    );
    assert_eq!(session.metadata[SERVICE_SOURCE_KEY], "labels");
    assert!(h
        .config_text()
        .contains("server_name backend.demo-abc.localhost;"));
}

#[tokio::test]
async fn test_sweep_prefers_session_config_file() {
    let h = Harness::new();
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(
        workdir.path().join("fork.toml"),
        "[[services]]\nname = \"app\"\nport = 8000\n",
    )
    .unwrap();

    let mut info = container("c1", "abc", "demo");
    info.labels.insert(
        labels::WORKDIR.into(),
        workdir.path().to_string_lossy().into_owned(),
    );
    info.labels
        .insert("dev.fork.service.api.port".into(), "4000".into());
    h.runtime.add_container(info);

    h.discovery.sweep().await.unwrap();

    let session = h.registry.get(&id("abc")).await.unwrap();
    assert_eq!(session.services, vec![Service::new("app", 8000)]);
    assert_eq!(session.metadata[SERVICE_SOURCE_KEY], "config_file");
    assert_eq!(session.workdir, workdir.path());
}

#[tokio::test]
async fn test_sweep_ignores_stopped_and_unlabeled_containers() {
    let h = Harness::new();
    let mut stopped = container("c1", "old", "demo");
    stopped.state = ContainerState::Exited;
    h.runtime.add_container(stopped);

    let mut unlabeled = container("c2", "x", "demo");
    unlabeled.labels.remove(labels::SESSION);
    h.runtime.add_container(unlabeled);

    let report = h.discovery.sweep().await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.skipped, 2);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_sweep_refreshes_known_session_container() {
    let h = Harness::new();
    h.registry
        .register(Session::new("abc", "demo").with_container("c1"))
        .await;
    h.runtime.add_container(container("c2", "abc", "demo"));

    let report = h.discovery.sweep().await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.refreshed, 1);
    assert_eq!(h.registry.get(&id("abc")).await.unwrap().container_id, "c2");
}

#[tokio::test]
async fn test_sweep_runtime_failure_is_reported() {
    let h = Harness::new();
    h.runtime.set_fail_list(true);
    let result = h.discovery.sweep().await;
    assert!(matches!(result, Err(DiscoveryError::Runtime(_))));
}

#[tokio::test]
async fn test_sweep_attaches_session_network() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));
    h.discovery.sweep().await.unwrap();

    assert_eq!(h.runtime.networks(), vec!["fork-abc".to_string()]);
    assert!(h.control.networks().contains(&"fork-abc".to_string()));
}

// ============================================================================
// Races
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_and_start_event_produce_one_entry() {
    for _ in 0..20 {
        let h = Harness::new();
        h.runtime.add_container(container("c1", "abc", "demo"));

        let (sweep, handled) = tokio::join!(
            h.discovery.sweep(),
            h.discovery
                .handle_event(event(EventAction::Start, "c1", "abc")),
        );
        sweep.unwrap();
        handled.unwrap();

        let sessions = h.registry.snapshot().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id.as_str(), "abc");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_discover_once() {
    let h = Harness::new();
    for n in 0..5 {
        h.runtime
            .add_container(container(&format!("c{n}"), &format!("s{n}"), "demo"));
    }

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let discovery = h.discovery.clone();
        tasks.push(tokio::spawn(async move { discovery.sweep().await.unwrap() }));
    }
    let mut discovered = 0;
    for task in tasks {
        discovered += task.await.unwrap().discovered;
    }

    assert_eq!(discovered, 5);
    assert_eq!(h.registry.len().await, 5);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_die_event_removes_session() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));
    h.discovery.sweep().await.unwrap();
    assert!(h.config_text().contains("web.demo-abc.localhost"));

    h.discovery
        .handle_event(event(EventAction::Die, "c1", "abc"))
        .await
        .unwrap();

    assert!(h.registry.is_empty().await);
    assert!(!h.config_text().contains("web.demo-abc.localhost"));

    let runtime = h.runtime.clone();
    assert!(
        wait_until(Duration::from_secs(2), || runtime
            .removed_networks()
            .contains(&"fork-abc".to_string()))
        .await
    );
}

#[tokio::test]
async fn test_late_event_from_replaced_container_is_ignored() {
    let h = Harness::new();
    h.registry
        .register(Session::new("abc", "demo").with_container("new-container"))
        .await;

    h.discovery
        .handle_event(event(EventAction::Die, "old-container", "abc"))
        .await
        .unwrap();

    assert!(h.registry.contains(&id("abc")).await);
}

#[tokio::test]
async fn test_destroy_event_without_label_matches_container() {
    let h = Harness::new();
    h.registry
        .register(Session::new("abc", "demo").with_container("0123456789abcdef"))
        .await;

    let mut destroy = event(EventAction::Remove, "0123456789ab", "abc");
    destroy.attributes.clear();
    h.discovery.handle_event(destroy).await.unwrap();

    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_event_for_unknown_session_is_ignored() {
    let h = Harness::new();
    h.registry.register(Session::new("abc", "demo")).await;

    h.discovery
        .handle_event(event(EventAction::Stop, "cx", "other"))
        .await
        .unwrap();
    h.discovery
        .handle_event(event(EventAction::Other, "cx", "abc"))
        .await
        .unwrap();

    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_event_loop_handles_events_and_resubscribes() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));
    h.discovery.sweep().await.unwrap();

    let cancel = CancellationToken::new();
    let handle = h.discovery.spawn_event_task(cancel.clone());

    let runtime = h.runtime.clone();
    assert!(wait_until(Duration::from_secs(2), || runtime.subscriptions() == 1).await);

    h.runtime
        .emit(event(EventAction::Kill, "c1", "abc"))
        .await;
    let registry = h.registry.clone();
    let mut emptied = false;
    for _ in 0..200 {
        if registry.is_empty().await {
            emptied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(emptied, "kill event should remove the session");

    h.runtime.close_events();
    let runtime = h.runtime.clone();
    assert!(
        wait_until(Duration::from_secs(8), || runtime.subscriptions() == 2).await,
        "event loop should resubscribe after the stream ends"
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("event loop stops on cancel")
        .unwrap();
}

// ============================================================================
// Validation and refresh
// ============================================================================

#[tokio::test]
async fn test_validate_removes_sessions_without_running_container() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));
    h.runtime.add_container(container("c2", "keep", "demo"));
    h.discovery.sweep().await.unwrap();
    h.registry.register(Session::new("manual", "demo")).await;

    h.runtime.set_state("c1", ContainerState::Exited);

    let removed = h.discovery.validate().await.unwrap();
    assert_eq!(removed, 1);

    assert!(!h.registry.contains(&id("abc")).await);
    assert!(h.registry.contains(&id("keep")).await);
    assert!(h.registry.contains(&id("manual")).await);
    assert!(!h.config_text().contains("demo-abc"));
}

#[tokio::test]
async fn test_validate_inspect_failure_still_updates_proxy() {
    let h = Harness::new();
    let web = vec![Service::new("web", 3000)];
    h.registry
        .register(Session::new("a", "demo").with_container("ca").with_services(web.clone()))
        .await;
    h.registry
        .register(Session::new("b", "demo").with_container("cb").with_services(web))
        .await;
    h.proxy.write_current().await.unwrap();
    assert!(h.config_text().contains("web.demo-a.localhost"));

    // `ca` is gone; inspecting `cb` fails.
    h.runtime.fail_inspect("cb");

    let removed = h.discovery.validate().await.unwrap();

    assert_eq!(removed, 1);
    assert!(!h.registry.contains(&id("a")).await);
    assert!(h.registry.contains(&id("b")).await);
    let config = h.config_text();
    assert!(!config.contains("web.demo-a.localhost"));
    assert!(config.contains("web.demo-b.localhost"));
}

#[tokio::test]
async fn test_validate_keeps_session_with_running_unlabeled_container() {
    let h = Harness::new();
    let mut plain = container("c9", "ignored", "demo");
    plain.labels.clear();
    h.runtime.add_container(plain);
    h.registry
        .register(Session::new("abc", "demo").with_container("c9"))
        .await;

    assert_eq!(h.discovery.validate().await.unwrap(), 0);
    assert!(h.registry.contains(&id("abc")).await);
}

#[tokio::test]
async fn test_refresh_session_updates_running_container() {
    let h = Harness::new();
    h.runtime.add_container(container("c1", "abc", "demo"));
    h.registry
        .register(Session::new("abc", "demo").with_container("c1"))
        .await;
    let before = h.registry.get(&id("abc")).await.unwrap().last_seen;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let status = h.discovery.refresh_session(&id("abc")).await.unwrap();

    assert_eq!(status, RefreshStatus::Updated);
    assert!(h.registry.get(&id("abc")).await.unwrap().last_seen > before);
}

#[tokio::test]
async fn test_refresh_session_removes_stopped_container() {
    let h = Harness::new();
    let mut stopped = container("c1", "abc", "demo");
    stopped.state = ContainerState::Exited;
    h.runtime.add_container(stopped);
    h.registry
        .register(Session::new("abc", "demo").with_container("c1"))
        .await;

    let status = h.discovery.refresh_session(&id("abc")).await.unwrap();
    assert_eq!(status, RefreshStatus::Removed);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_refresh_session_unknown_is_not_found() {
    let h = Harness::new();
    let result = h.discovery.refresh_session(&id("ghost")).await;
    assert!(matches!(result, Err(DiscoveryError::Registry(_))));
}

#[tokio::test]
async fn test_refresh_all_validates_then_sweeps() {
    let h = Harness::new();
    h.registry
        .register(Session::new("stale", "demo").with_container("dead"))
        .await;
    h.runtime.add_container(container("c1", "fresh", "demo"));

    let report = h.discovery.refresh_all().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.discovered, 1);
    assert_eq!(report.failed, 0);
    assert!(h.registry.contains(&id("fresh")).await);
}
