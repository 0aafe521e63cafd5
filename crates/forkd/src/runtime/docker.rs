//! Docker CLI backend.
//!
//! Every runtime operation shells out to the `docker` binary. Structured
//! output is requested as JSON and decoded with serde; the event stream is
//! a long-lived `docker events` child whose lines are forwarded into a
//! channel.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use fork_core::labels;

use super::{
    ContainerInfo, ContainerRuntime, ContainerState, EventAction, EventStream, LifecycleEvent,
    RuntimeError,
};

/// Capacity of the event channel.
const EVENT_BUFFER: usize = 64;

// ============================================================================
// CLI wrapper
// ============================================================================

/// Thin async wrapper around the docker binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs a command to completion and returns its stdout.
    ///
    /// A non-zero exit becomes `RuntimeError::Command` carrying stderr.
    pub async fn run<I, S>(&self, args: I) -> Result<String, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args
            .into_iter()
            .map(|a| a.as_ref().to_os_string())
            .collect();
        let command = self.describe(&args);
        trace!(command = %command, "Running container CLI");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawns a long-running command with piped stdout.
    ///
    /// The child is killed when its handle is dropped.
    pub fn spawn_streaming<I, S>(&self, args: I) -> Result<Child, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    fn describe(&self, args: &[std::ffi::OsString]) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

// ============================================================================
// Runtime implementation
// ============================================================================

/// `ContainerRuntime` backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    cli: DockerCli,
}

impl DockerRuntime {
    pub fn new(cli: DockerCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let filter = format!("label={label_filter}");
        let ids_output = self
            .cli
            .run(["ps", "-a", "-q", "--no-trunc", "--filter", filter.as_str()])
            .await?;

        let ids: Vec<&str> = ids_output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect"];
        args.extend(ids.iter().copied());
        match self.cli.run(args).await {
            Ok(json) => parse_inspect(&json),
            // A container vanished between `ps` and `inspect`; fall back to
            // inspecting one by one.
            Err(e) if e.is_not_found() => {
                let mut containers = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(info) = self.inspect_container(id).await? {
                        containers.push(info);
                    }
                }
                Ok(containers)
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self.cli.run(["inspect", id]).await {
            Ok(json) => Ok(parse_inspect(&json)?.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn subscribe_events(&self, label_filter: &str) -> Result<EventStream, RuntimeError> {
        let label = format!("label={label_filter}");
        let mut child = self.cli.spawn_streaming([
            "events",
            "--filter",
            "type=container",
            "--filter",
            label.as_str(),
            "--format",
            "{{json .}}",
        ])?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Unavailable("event stream has no stdout".to_string())
        })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_event(&line) else {
                            trace!(line = %line, "Ignoring undecodable event line");
                            continue;
                        };
                        if tx.send(event).await.is_err() {
                            debug!("Event receiver dropped, stopping event stream");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Event stream closed by runtime");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read event stream");
                        break;
                    }
                }
            }

            let _ = child.start_kill();
            let _ = child.wait().await;
        });

        Ok(rx)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self.cli.run(["network", "inspect", name]).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let marker = labels::marker_filter();
        match self
            .cli
            .run(["network", "create", "--label", marker.as_str(), name])
            .await
        {
            Ok(_) => {
                debug!(network = %name, "Network created");
                Ok(())
            }
            // Created concurrently by someone else
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_network_if_unused(&self, name: &str) -> Result<bool, RuntimeError> {
        let attached = match self
            .cli
            .run(["network", "inspect", "--format", "{{len .Containers}}", name])
            .await
        {
            Ok(out) => out.trim().parse::<usize>().map_err(|e| {
                RuntimeError::Parse(format!("container count for network {name}: {e}"))
            })?,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        if attached > 0 {
            debug!(network = %name, attached, "Network still in use");
            return Ok(false);
        }

        match self.cli.run(["network", "rm", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Output decoding
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl From<InspectEntry> for ContainerInfo {
    fn from(entry: InspectEntry) -> Self {
        let state = if entry.state.running {
            ContainerState::Running
        } else {
            ContainerState::parse(&entry.state.status)
        };

        Self {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            state,
            labels: entry.config.labels.unwrap_or_default(),
        }
    }
}

/// Decodes `docker inspect` output.
fn parse_inspect(json: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(e.to_string()))?;
    Ok(entries.into_iter().map(ContainerInfo::from).collect())
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
}

#[derive(Debug, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Decodes one `docker events --format '{{json .}}'` line.
fn parse_event(line: &str) -> Option<LifecycleEvent> {
    let raw: RawEvent = serde_json::from_str(line.trim()).ok()?;

    let action = if raw.action.is_empty() {
        raw.status
    } else {
        raw.action
    };
    let container_id = if raw.actor.id.is_empty() {
        raw.id
    } else {
        raw.actor.id
    };
    if container_id.is_empty() {
        return None;
    }

    Some(LifecycleEvent {
        action: EventAction::parse(&action),
        container_id,
        attributes: raw.actor.attributes,
    })
}
