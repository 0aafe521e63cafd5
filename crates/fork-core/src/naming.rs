//! Deterministic names derived from session identity.
//!
//! The proxy configuration, the session container and the session network
//! all agree on these names, so they must never depend on runtime state.

use crate::session::{Service, SessionId};

/// Prefix of every per-session network.
pub const NETWORK_PREFIX: &str = "fork-";

/// Lowercases `raw` and replaces anything outside `[a-z0-9-]` with `-`.
///
/// Leading and trailing dashes are trimmed. An input with no usable
/// characters maps to `"x"` so the result is always a valid DNS label.
pub fn sanitize_dns_label(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Returns true if `raw` is usable as a session id, service name or
/// subdomain: non-empty and made only of `[A-Za-z0-9._-]`.
///
/// These values end up in the rendered proxy configuration, so anything
/// else (whitespace, braces, semicolons, control characters) is rejected.
pub fn is_valid_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Host name of the session container on its network: `<project>-<id>`.
pub fn upstream_host(project: &str, session_id: &SessionId) -> String {
    format!(
        "{}-{}",
        sanitize_dns_label(project),
        sanitize_dns_label(session_id.as_str())
    )
}

/// Public hostname of a service: `<subdomain>.<project>-<id>.<domain>`.
pub fn hostname(service: &Service, project: &str, session_id: &SessionId, domain: &str) -> String {
    format!(
        "{}.{}.{}",
        sanitize_dns_label(service.effective_subdomain()),
        upstream_host(project, session_id),
        domain.trim_matches('.')
    )
}

/// Name of the dedicated network of a session.
pub fn network_name(session_id: &SessionId) -> String {
    format!("{NETWORK_PREFIX}{}", sanitize_dns_label(session_id.as_str()))
}
