//! Service resolution for discovered containers.
//!
//! Tiers are tried in order and the first one yielding at least one
//! service wins:
//! 1. `fork.toml` in the session's working directory
//! 2. per-service container labels
//! 3. a single default service
//!
//! All functions here are synchronous; the config file read is blocking
//! I/O and callers run `resolve_services` via `spawn_blocking`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use fork_core::labels::parse_service_label;
use fork_core::{is_valid_name, Service};

use crate::config::SESSION_CONFIG_FILE;

/// Which tier produced a service list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSource {
    ConfigFile,
    Labels,
    Default,
}

impl ServiceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigFile => "config_file",
            Self::Labels => "labels",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved services tagged with the tier that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServices {
    pub source: ServiceSource,
    pub services: Vec<Service>,
}

/// Runs the tiers in order.
pub fn resolve_services(
    workdir: Option<&Path>,
    labels: &HashMap<String, String>,
) -> ResolvedServices {
    if let Some(services) = workdir.and_then(from_config_file) {
        return ResolvedServices {
            source: ServiceSource::ConfigFile,
            services,
        };
    }

    let services = from_labels(labels);
    if !services.is_empty() {
        return ResolvedServices {
            source: ServiceSource::Labels,
            services,
        };
    }

    ResolvedServices {
        source: ServiceSource::Default,
        services: vec![Service::fallback()],
    }
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
    port: u16,
    #[serde(default)]
    subdomain: Option<String>,
}

/// Reads services from `<workdir>/fork.toml`.
///
/// Returns `None` when the file is missing, unparseable, or declares no
/// usable service.
pub fn from_config_file(workdir: &Path) -> Option<Vec<Service>> {
    let path = workdir.join(SESSION_CONFIG_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No session config file");
            return None;
        }
    };

    let services = parse_config(&contents);
    if services.is_none() {
        warn!(path = %path.display(), "Session config file unusable, falling back");
    }
    services
}

/// Parses the services of a session config file.
pub fn parse_config(contents: &str) -> Option<Vec<Service>> {
    let file: SessionFile = match toml::from_str(contents) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "Failed to parse session config");
            return None;
        }
    };

    let services: Vec<Service> = file
        .services
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.trim();
            if !is_valid_name(name) || entry.port == 0 {
                warn!(
                    service = %name.escape_debug(),
                    port = entry.port,
                    "Dropping invalid service entry"
                );
                return None;
            }
            let service = Service::new(name, entry.port);
            match entry.subdomain.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(subdomain) if is_valid_name(subdomain) => {
                    Some(service.with_subdomain(subdomain))
                }
                Some(subdomain) => {
                    warn!(
                        service = %name,
                        subdomain = %subdomain.escape_debug(),
                        "Ignoring invalid subdomain"
                    );
                    Some(service)
                }
                None => Some(service),
            }
        })
        .collect();

    if services.is_empty() {
        None
    } else {
        Some(services)
    }
}

/// Reconstructs services from `dev.fork.service.<name>.*` labels.
///
/// Services without a valid port or with a name outside `[A-Za-z0-9._-]`
/// are dropped; an invalid subdomain falls back to the name. The result
/// is ordered by service name.
pub fn from_labels(labels: &HashMap<String, String>) -> Vec<Service> {
    #[derive(Default)]
    struct Partial<'a> {
        port: Option<&'a str>,
        subdomain: Option<&'a str>,
    }

    let mut partials: BTreeMap<&str, Partial<'_>> = BTreeMap::new();
    for (key, value) in labels {
        let Some((name, field)) = parse_service_label(key) else {
            continue;
        };
        let entry = partials.entry(name).or_default();
        match field {
            "port" => entry.port = Some(value.as_str()),
            "subdomain" => entry.subdomain = Some(value.as_str()),
            _ => {}
        }
    }

    partials
        .into_iter()
        .filter_map(|(name, partial)| {
            if !is_valid_name(name) {
                warn!(service = %name.escape_debug(), "Dropping service label with invalid name");
                return None;
            }
            let port = match partial.port.map(|p| p.trim().parse::<u16>()) {
                Some(Ok(port)) if port != 0 => port,
                _ => {
                    debug!(service = %name, "Dropping service label without a valid port");
                    return None;
                }
            };
            let service = Service::new(name, port);
            Some(match partial
                .subdomain
                .map(str::trim)
                .filter(|s| !s.is_empty() && is_valid_name(s))
            {
                Some(subdomain) => service.with_subdomain(subdomain),
                None => service,
            })
        })
        .collect()
}
