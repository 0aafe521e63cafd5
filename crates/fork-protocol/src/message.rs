//! Request/response frames for the control socket.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fork_core::Session;

use crate::payload::{ErrorPayload, NextIdPayload, SessionListPayload, VersionPayload};
use crate::version::ProtocolVersion;

/// Request types a client can send to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Upsert a session
    RegisterSession,
    /// Remove a session
    UnregisterSession,
    /// List all sessions
    ListSessions,
    /// Fetch one session
    GetSessionInfo,
    /// Re-inspect the backing container of one session
    RefreshSession,
    /// Full discovery and validation pass
    RefreshAll,
    /// Hand out the next sequential identifier
    RequestNextId,
    /// Liveness check
    HealthCheck,
    /// Run a discovery sweep now
    TriggerDiscovery,
    /// Daemon and protocol version
    GetVersion,
    /// Any type this daemon does not understand
    #[serde(other)]
    Unknown,
}

/// Response types sent by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    Success,
    Error,
    SessionList,
    SessionInfo,
    NextId,
    VersionInfo,
}

/// Machine-readable error classification carried in error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Referenced session does not exist
    NotFound,
    /// Payload did not match the request type
    InvalidPayload,
    /// Request type not understood
    UnknownType,
    /// Frame was not valid JSON or exceeded the size limit
    ParseError,
    /// Daemon-side failure
    Internal,
}

/// A client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request type
    #[serde(rename = "type")]
    pub kind: RequestKind,

    /// Correlation id, echoed in the response
    #[serde(default)]
    pub id: String,

    /// Type-specific payload
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Creates a request with an empty payload.
    pub fn new(kind: RequestKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            payload: Value::Null,
        }
    }

    /// Attaches a serializable payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Decodes the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// A daemon response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Response type
    #[serde(rename = "type")]
    pub kind: ResponseKind,

    /// Correlation id copied from the request
    pub id: String,

    /// Type-specific payload
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    fn new<T: Serialize>(kind: ResponseKind, id: impl Into<String>, payload: &T) -> Self {
        Self {
            kind,
            id: id.into(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    /// Creates a success response.
    pub fn success<T: Serialize>(id: impl Into<String>, payload: &T) -> Self {
        Self::new(ResponseKind::Success, id, payload)
    }

    /// Creates an error response.
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            ResponseKind::Error,
            id,
            &ErrorPayload {
                message: message.into(),
                code,
            },
        )
    }

    /// Creates a session list response.
    pub fn session_list(id: impl Into<String>, sessions: Vec<Session>) -> Self {
        Self::new(ResponseKind::SessionList, id, &SessionListPayload { sessions })
    }

    /// Creates a session info response.
    pub fn session_info(id: impl Into<String>, session: &Session) -> Self {
        Self::new(ResponseKind::SessionInfo, id, session)
    }

    /// Creates a next-id response.
    pub fn next_id(id: impl Into<String>, next: u64) -> Self {
        Self::new(
            ResponseKind::NextId,
            id,
            &NextIdPayload {
                id: next.to_string(),
            },
        )
    }

    /// Creates a version-info response for this build.
    pub fn version_info(id: impl Into<String>, version: &str) -> Self {
        Self::new(
            ResponseKind::VersionInfo,
            id,
            &VersionPayload {
                version: version.to_string(),
                protocol_version: ProtocolVersion::CURRENT,
            },
        )
    }

    /// Returns true for error responses.
    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// Decodes the error payload, if this is an error response.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if !self.is_error() {
            return None;
        }
        ErrorPayload::deserialize(&self.payload).ok()
    }

    /// Decodes the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
