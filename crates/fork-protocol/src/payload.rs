//! Typed payloads carried inside request and response frames.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use fork_core::{DomainResult, Service, Session, SessionId};

use crate::message::ErrorCode;
use crate::version::ProtocolVersion;

/// Payload of `register-session`.
///
/// Timestamps are assigned by the daemon, never by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub id: SessionId,
    pub project: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub workdir: PathBuf,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RegisterPayload {
    /// Converts into a validated session stamped with the current time.
    pub fn into_session(self) -> DomainResult<Session> {
        let now = Utc::now();
        Session {
            id: self.id,
            project: self.project,
            container_id: self.container_id,
            workdir: self.workdir,
            services: self.services,
            metadata: self.metadata,
            registered_at: now,
            last_seen: now,
        }
        .validate()
    }
}

/// Payload naming a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: SessionId,
}

impl SessionRef {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            session_id: id.into(),
        }
    }
}

/// Payload of `session-list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListPayload {
    pub sessions: Vec<Session>,
}

/// Payload of `next-id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextIdPayload {
    pub id: String,
}

/// Payload of `version-info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: String,
    pub protocol_version: ProtocolVersion,
}

/// Payload of `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
}

/// Success payload of `health-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub sessions: usize,
    pub uptime_secs: u64,
}

/// Success payload of `trigger-discovery`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub discovered: u32,
    pub failed: u32,
}

/// Success payload of `refresh-all`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RefreshAllPayload {
    pub discovered: u32,
    pub failed: u32,
    pub removed: u32,
}

/// What `refresh-session` did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Backing container found; last-seen and container id updated
    Updated,
    /// Backing container gone; session removed
    Removed,
}

/// Success payload of `refresh-session`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefreshPayload {
    pub status: RefreshStatus,
}
