//! Daemon configuration.
//!
//! Paths and proxy settings come from the environment with sensible
//! defaults. Loop intervals are compile-time constants and live next to
//! the loops that use them.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding the control socket path.
pub const ENV_SOCKET: &str = "FORKD_SOCKET";
/// Environment variable overriding the state directory.
pub const ENV_STATE_DIR: &str = "FORKD_STATE_DIR";
/// Environment variable overriding the hostname suffix.
pub const ENV_DOMAIN: &str = "FORKD_DOMAIN";
/// Environment variable overriding the proxy host port.
pub const ENV_PROXY_PORT: &str = "FORKD_PROXY_PORT";
/// Environment variable overriding the proxy image.
pub const ENV_PROXY_IMAGE: &str = "FORKD_PROXY_IMAGE";
/// Environment variable overriding the container CLI binary.
pub const ENV_DOCKER: &str = "FORKD_DOCKER";

pub const DEFAULT_DOMAIN: &str = "localhost";
pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_PROXY_IMAGE: &str = "nginx:alpine";
pub const DEFAULT_PROXY_CONTAINER: &str = "fork-proxy";
pub const DEFAULT_DOCKER_BIN: &str = "docker";

/// Name of the per-session services file read from a session workdir.
pub const SESSION_CONFIG_FILE: &str = "fork.toml";

/// Reverse-proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Container name of the proxy
    pub container_name: String,
    /// Image the proxy container is created from
    pub image: String,
    /// Host port published to the proxy's port 80
    pub host_port: u16,
    /// Directory holding the rendered config, bind-mounted into the proxy
    pub config_dir: PathBuf,
}

impl ProxyConfig {
    /// Path of the rendered configuration file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("default.conf")
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Control socket path
    pub socket_path: PathBuf,
    /// Directory for counter state, PID record, proxy config and logs
    pub state_dir: PathBuf,
    /// Hostname suffix for every virtual host
    pub domain: String,
    /// Container CLI binary
    pub docker_bin: String,
    /// Reverse-proxy settings
    pub proxy: ProxyConfig,
}

impl DaemonConfig {
    /// Builds a configuration rooted at `state_dir` with default settings.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            socket_path: state_dir.join("forkd.sock"),
            domain: DEFAULT_DOMAIN.to_string(),
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            proxy: ProxyConfig {
                container_name: DEFAULT_PROXY_CONTAINER.to_string(),
                image: DEFAULT_PROXY_IMAGE.to_string(),
                host_port: DEFAULT_PROXY_PORT,
                config_dir: state_dir.join("proxy"),
            },
            state_dir,
        }
    }

    /// Resolves the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = lookup(ENV_STATE_DIR)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let mut config = Self::with_state_dir(state_dir);

        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.trim().is_empty()) {
            config.socket_path = PathBuf::from(socket);
        }
        if let Some(domain) = lookup(ENV_DOMAIN).filter(|s| !s.trim().is_empty()) {
            config.domain = domain.trim().trim_matches('.').to_string();
        }
        if let Some(port) = lookup(ENV_PROXY_PORT).and_then(|p| p.trim().parse::<u16>().ok()) {
            config.proxy.host_port = port;
        }
        if let Some(image) = lookup(ENV_PROXY_IMAGE).filter(|s| !s.trim().is_empty()) {
            config.proxy.image = image;
        }
        if let Some(bin) = lookup(ENV_DOCKER).filter(|s| !s.trim().is_empty()) {
            config.docker_bin = bin;
        }

        config
    }

    /// Counter state file.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// PID record file.
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("forkd.pid")
    }

    /// Log file used when daemonized.
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("forkd.log")
    }

    /// Returns the state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::with_state_dir(default_state_dir())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("fork")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_state_dir() {
        let config = DaemonConfig::from_lookup(lookup_from(&[(ENV_STATE_DIR, "/var/fork")]));
        assert_eq!(config.socket_path, PathBuf::from("/var/fork/forkd.sock"));
        assert_eq!(config.state_file(), PathBuf::from("/var/fork/state.json"));
        assert_eq!(config.pid_file(), PathBuf::from("/var/fork/forkd.pid"));
        assert_eq!(
            config.proxy.config_path(),
            PathBuf::from("/var/fork/proxy/default.conf")
        );
        assert_eq!(config.domain, DEFAULT_DOMAIN);
        assert_eq!(config.proxy.host_port, DEFAULT_PROXY_PORT);
    }

    #[test]
    fn test_env_overrides() {
        let config = DaemonConfig::from_lookup(lookup_from(&[
            (ENV_STATE_DIR, "/s"),
            (ENV_SOCKET, "/run/forkd.sock"),
            (ENV_DOMAIN, ".fork.test."),
            (ENV_PROXY_PORT, "9000"),
            (ENV_DOCKER, "podman"),
        ]));
        assert_eq!(config.socket_path, PathBuf::from("/run/forkd.sock"));
        assert_eq!(config.domain, "fork.test");
        assert_eq!(config.proxy.host_port, 9000);
        assert_eq!(config.docker_bin, "podman");
    }

    #[test]
    fn test_invalid_port_ignored() {
        let config = DaemonConfig::from_lookup(lookup_from(&[
            (ENV_STATE_DIR, "/s"),
            (ENV_PROXY_PORT, "not-a-port"),
        ]));
        assert_eq!(config.proxy.host_port, DEFAULT_PROXY_PORT);
    }
}
