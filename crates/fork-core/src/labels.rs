//! Container label contract.
//!
//! Containers started for a session carry these labels. The daemon never
//! creates session containers itself; it only reads these labels back.

/// Marker label key present on every container belonging to a session.
pub const MANAGED: &str = "dev.fork.managed";

/// Value of the marker label.
pub const MANAGED_VALUE: &str = "true";

/// Session identifier label.
pub const SESSION: &str = "dev.fork.session";

/// Project name label.
pub const PROJECT: &str = "dev.fork.project";

/// Host working directory of the session.
pub const WORKDIR: &str = "dev.fork.workdir";

/// Prefix for per-service labels: `dev.fork.service.<name>.port`.
pub const SERVICE_PREFIX: &str = "dev.fork.service.";

/// Project name used when a container carries no project label.
pub const DEFAULT_PROJECT: &str = "fork";

/// Returns the `key=value` filter string for the marker label.
pub fn marker_filter() -> String {
    format!("{MANAGED}={MANAGED_VALUE}")
}

/// Splits a per-service label key into `(service_name, field)`.
///
/// `dev.fork.service.web.port` → `Some(("web", "port"))`.
pub fn parse_service_label(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICE_PREFIX)?;
    let (name, field) = rest.rsplit_once('.')?;
    if name.is_empty() || field.is_empty() {
        return None;
    }
    Some((name, field))
}
