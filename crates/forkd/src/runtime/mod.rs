//! Container runtime access.
//!
//! The daemon only consumes the runtime: it lists and inspects labeled
//! containers, follows their lifecycle events, and manages per-session
//! networks. Everything goes through the [`ContainerRuntime`] trait so the
//! reconciliation logic can run against an in-memory runtime in tests.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use fork_core::{is_valid_name, labels, SessionId};

mod docker;

pub use docker::{DockerCli, DockerRuntime};

/// Stream of lifecycle events. Closes when the subscription ends.
pub type EventStream = mpsc::Receiver<LifecycleEvent>;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime CLI could not be executed.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The runtime CLI ran but reported failure.
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Runtime output could not be decoded.
    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    /// The runtime is not reachable or not in a usable state.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// Returns true if the runtime reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Command { stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                lower.contains("no such") || lower.contains("not found")
            }
            _ => false,
        }
    }

    /// Returns true if the runtime reported the object already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Command { stderr, .. } => stderr.to_ascii_lowercase().contains("already exists"),
            _ => false,
        }
    }
}

/// Run state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Other,
}

impl ContainerState {
    /// Parses the runtime's state string.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Other,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// What the daemon knows about one container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// Returns a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Session id from the session label, if present and a valid name.
    pub fn session_id(&self) -> Option<SessionId> {
        self.label(labels::SESSION)
            .map(str::trim)
            .filter(|s| is_valid_name(s))
            .map(SessionId::new)
    }

    /// Project name from the project label, or the default project.
    pub fn project(&self) -> String {
        self.label(labels::PROJECT)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(labels::DEFAULT_PROJECT)
            .to_string()
    }

    /// Recorded working directory, if any.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.label(labels::WORKDIR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Kill,
    Remove,
    Other,
}

impl EventAction {
    /// Parses an action string; suffixes such as `exec_start: sh` map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "destroy" | "remove" => Self::Remove,
            _ => Self::Other,
        }
    }

    /// True for actions after which the session is gone.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Stop | Self::Die | Self::Kill | Self::Remove)
    }
}

/// One container lifecycle notification.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub action: EventAction,
    pub container_id: String,
    /// Actor attributes; include the container labels
    pub attributes: HashMap<String, String>,
}

impl LifecycleEvent {
    /// Session id carried in the event attributes.
    pub fn session_id(&self) -> Option<SessionId> {
        self.attributes
            .get(labels::SESSION)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(SessionId::new)
    }
}

/// Consumed container-runtime operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists containers carrying `label_filter` (`key=value`) in any state.
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Inspects one container; `Ok(None)` if it does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// Subscribes to lifecycle events of containers carrying `label_filter`.
    async fn subscribe_events(&self, label_filter: &str) -> Result<EventStream, RuntimeError>;

    /// Creates the network if it does not exist.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Removes the network if no containers are attached.
    ///
    /// Returns true if the network was removed.
    async fn remove_network_if_unused(&self, name: &str) -> Result<bool, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_parse() {
        assert!(ContainerState::parse("running").is_running());
        assert!(ContainerState::parse("Running").is_running());
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("weird"), ContainerState::Other);
    }

    #[test]
    fn test_event_action_parse() {
        assert_eq!(EventAction::parse("start"), EventAction::Start);
        assert_eq!(EventAction::parse("destroy"), EventAction::Remove);
        assert!(EventAction::parse("die").ends_session());
        assert!(!EventAction::parse("start").ends_session());
        assert_eq!(EventAction::parse("exec_start: sh"), EventAction::Other);
    }

    #[test]
    fn test_container_identity_from_labels() {
        let mut labels = HashMap::new();
        labels.insert(labels::SESSION.to_string(), "xyz".to_string());
        labels.insert(labels::WORKDIR.to_string(), "/work/xyz".to_string());
        let info = ContainerInfo {
            id: "c1".into(),
            name: "demo-xyz".into(),
            state: ContainerState::Running,
            labels,
        };
        assert_eq!(info.session_id(), Some(SessionId::new("xyz")));
        assert_eq!(info.project(), labels::DEFAULT_PROJECT);
        assert_eq!(info.workdir(), Some(PathBuf::from("/work/xyz")));

        let mut hostile = info.clone();
        hostile
            .labels
            .insert(labels::SESSION.to_string(), "x;\n}".to_string());
        assert_eq!(hostile.session_id(), None);
    }

    #[test]
    fn test_error_classification() {
        let err = RuntimeError::Command {
            command: "docker inspect x".into(),
            stderr: "Error: No such object: x".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());

        let err = RuntimeError::Command {
            command: "docker network connect".into(),
            stderr: "endpoint with name fork-proxy already exists in network fork-a".into(),
        };
        assert!(err.is_already_exists());
    }
}
