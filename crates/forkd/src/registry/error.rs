//! Registry errors and outcome types.

use fork_core::SessionId;
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No session with this id existed.
    Created,
    /// An existing session with this id was overwritten.
    Replaced,
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Client explicitly requested removal.
    Explicit,

    /// The runtime reported a stop/die/kill/remove event for the container.
    ContainerStopped,

    /// A validation sweep no longer found the container running.
    ContainerMissing,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly removed"),
            Self::ContainerStopped => write!(f, "container stopped"),
            Self::ContainerMissing => write!(f, "container no longer running"),
        }
    }
}
