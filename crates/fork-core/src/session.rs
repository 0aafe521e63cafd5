//! Session domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::naming::is_valid_name;

/// Allowed characters of ids, service names and subdomains.
const NAME_CHARSET: &str = "[A-Za-z0-9._-]";

/// Name of the service synthesized when a session declares none.
pub const DEFAULT_SERVICE_NAME: &str = "web";

/// Port of the service synthesized when a session declares none.
pub const DEFAULT_SERVICE_PORT: u16 = 3000;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a session.
///
/// Immutable once the session exists. Registering the same identifier
/// again replaces the stored session in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty or whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Service
// ============================================================================

/// One named, ported endpoint exposed by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name, unique within its session
    pub name: String,

    /// Port the service listens on inside the session container
    pub port: u16,

    /// Subdomain used for routing; falls back to `name` when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

impl Service {
    /// Creates a service whose subdomain defaults to its name.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            subdomain: None,
        }
    }

    /// Sets an explicit subdomain.
    #[must_use]
    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    /// The synthesized default service.
    pub fn fallback() -> Self {
        Self::new(DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_PORT)
    }

    /// Returns the routing subdomain: the explicit one, or the name when
    /// the subdomain is absent or blank.
    pub fn effective_subdomain(&self) -> &str {
        match self.subdomain.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => &self.name,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A registered development session backed by one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Globally unique identifier
    pub id: SessionId,

    /// Project the session was forked from
    pub project: String,

    /// Backing container identifier
    #[serde(default)]
    pub container_id: String,

    /// Host working directory of the session
    #[serde(default)]
    pub workdir: PathBuf,

    /// Exposed services (order is not significant)
    #[serde(default)]
    pub services: Vec<Service>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// When the session was first registered
    pub registered_at: DateTime<Utc>,

    /// When the session was last observed or refreshed
    pub last_seen: DateTime<Utc>,
}

impl Session {
    /// Creates a session with no services, stamped with the current time.
    pub fn new(id: impl Into<SessionId>, project: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project: project.into(),
            container_id: String::new(),
            workdir: PathBuf::new(),
            services: Vec::new(),
            metadata: BTreeMap::new(),
            registered_at: now,
            last_seen: now,
        }
    }

    /// Sets the backing container.
    #[must_use]
    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Replaces the services, keeping names unique (later entries win).
    #[must_use]
    pub fn with_services(mut self, services: Vec<Service>) -> Self {
        self.services = dedup_services(services);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if the session contributes at least one virtual host.
    pub fn is_routable(&self) -> bool {
        !self.services.is_empty()
    }

    /// Records that the session was observed now, optionally against a
    /// new backing container.
    pub fn touch(&mut self, container_id: Option<&str>) {
        if let Some(id) = container_id {
            if !id.is_empty() && id != self.container_id {
                debug!(
                    session_id = %self.id,
                    old = %self.container_id,
                    new = %id,
                    "Backing container changed"
                );
                self.container_id = id.to_string();
            }
        }
        self.last_seen = Utc::now();
    }

    /// Validates identity fields and normalizes services.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingField` for a blank id, project or
    /// service name, and `DomainError::InvalidFieldValue` for a service
    /// with port 0 or an id, service name or subdomain outside
    /// `[A-Za-z0-9._-]`.
    pub fn validate(mut self) -> DomainResult<Self> {
        if self.id.is_blank() {
            return Err(DomainError::missing("id"));
        }
        if !is_valid_name(self.id.as_str()) {
            return Err(DomainError::invalid("id", self.id.as_str(), NAME_CHARSET));
        }
        if self.project.trim().is_empty() {
            return Err(DomainError::missing("project"));
        }
        if self.project.chars().any(char::is_control) {
            return Err(DomainError::invalid(
                "project",
                &self.project,
                "no control characters",
            ));
        }
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(DomainError::missing("services.name"));
            }
            if !is_valid_name(&service.name) {
                return Err(DomainError::invalid("services.name", &service.name, NAME_CHARSET));
            }
            if let Some(subdomain) = service.subdomain.as_deref() {
                if !subdomain.trim().is_empty() && !is_valid_name(subdomain) {
                    return Err(DomainError::invalid(
                        "services.subdomain",
                        subdomain,
                        NAME_CHARSET,
                    ));
                }
            }
            if service.port == 0 {
                return Err(DomainError::InvalidFieldValue {
                    field: format!("services.{}.port", service.name),
                    value: "0".to_string(),
                    expected: "1-65535".to_string(),
                });
            }
        }
        self.services = dedup_services(std::mem::take(&mut self.services));
        Ok(self)
    }
}

/// Keeps service names unique; a later service replaces an earlier one
/// with the same name at the earlier position.
fn dedup_services(services: Vec<Service>) -> Vec<Service> {
    let mut out: Vec<Service> = Vec::with_capacity(services.len());
    for service in services {
        match out.iter_mut().find(|s| s.name == service.name) {
            Some(existing) => *existing = service,
            None => out.push(service),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_subdomain_defaults_to_name() {
        let svc = Service::new("api", 8000);
        assert_eq!(svc.effective_subdomain(), "api");

        let svc = Service::new("api", 8000).with_subdomain("");
        assert_eq!(svc.effective_subdomain(), "api");

        let svc = Service::new("api", 8000).with_subdomain("backend");
        assert_eq!(svc.effective_subdomain(), "backend");
    }

    #[test]
    fn test_duplicate_service_names_keep_last() {
        let session = Session::new("abc", "demo").with_services(vec![
            Service::new("web", 3000),
            Service::new("api", 4000),
            Service::new("web", 3001),
        ]);
        assert_eq!(session.services.len(), 2);
        assert_eq!(session.services[0].name, "web");
        assert_eq!(session.services[0].port, 3001);
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        assert!(Session::new("", "demo").validate().is_err());
        assert!(Session::new("abc", " ").validate().is_err());

        let bad_port = Session::new("abc", "demo").with_services(vec![Service::new("web", 0)]);
        let err = bad_port.validate().unwrap_err();
        assert!(err.to_string().contains("services.web.port"));
    }

    #[test]
    fn test_validate_rejects_config_breaking_names() {
        let injected = Session::new("abc", "demo").with_services(vec![Service::new(
            "web\n}\nserver { listen 80; return 500; }\n#",
            3000,
        )]);
        let err = injected.validate().unwrap_err();
        assert!(err.to_string().contains("services.name"));

        let bad_subdomain = Session::new("abc", "demo")
            .with_services(vec![Service::new("web", 3000).with_subdomain("a b")]);
        assert!(bad_subdomain.validate().is_err());

        assert!(Session::new("a;b", "demo").validate().is_err());
        assert!(Session::new("abc", "demo\n#").validate().is_err());

        let ok = Session::new("abc-1.x", "My Project").with_services(vec![
            Service::new("api_v2", 8000).with_subdomain("backend"),
        ]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_touch_updates_container() {
        let mut session = Session::new("abc", "demo").with_container("c1");
        let before = session.last_seen;
        session.touch(Some("c2"));
        assert_eq!(session.container_id, "c2");
        assert!(session.last_seen >= before);

        session.touch(Some(""));
        assert_eq!(session.container_id, "c2");
    }

    #[test]
    fn test_session_serde_defaults() {
        let json = r#"{
            "id": "abc",
            "project": "demo",
            "registered_at": "2024-01-01T00:00:00Z",
            "last_seen": "2024-01-01T00:00:00Z"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert!(session.services.is_empty());
        assert!(!session.is_routable());
        assert!(session.metadata.is_empty());
    }
}
