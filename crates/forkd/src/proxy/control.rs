//! Reverse-proxy process control.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::runtime::{DockerCli, RuntimeError};

use super::render::HEALTH_PATH;

/// Control surface of the single proxy process.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Returns true if the proxy process is running.
    async fn is_running(&self) -> Result<bool, RuntimeError>;

    /// Starts the proxy, creating it first if it does not exist.
    async fn start(&self) -> Result<(), RuntimeError>;

    /// Stops the proxy. Stopping an absent proxy succeeds.
    async fn stop(&self) -> Result<(), RuntimeError>;

    /// Removes the proxy. Removing an absent proxy succeeds.
    async fn remove(&self) -> Result<(), RuntimeError>;

    /// Asks the running proxy to reload its configuration.
    async fn reload(&self) -> Result<(), RuntimeError>;

    /// Force-restarts the proxy, starting it if it does not exist.
    async fn restart(&self) -> Result<(), RuntimeError>;

    /// Requests the proxy's health endpoint.
    async fn check_health(&self) -> Result<(), RuntimeError>;

    /// Attaches the proxy to a network. Already attached is success.
    async fn connect_network(&self, network: &str) -> Result<(), RuntimeError>;

    /// Detaches the proxy from a network. Not attached is success.
    async fn disconnect_network(&self, network: &str) -> Result<(), RuntimeError>;
}

/// nginx proxy running as a docker container.
#[derive(Debug, Clone)]
pub struct DockerProxy {
    cli: DockerCli,
    config: ProxyConfig,
}

impl DockerProxy {
    pub fn new(cli: DockerCli, config: ProxyConfig) -> Self {
        Self { cli, config }
    }

    fn name(&self) -> &str {
        &self.config.container_name
    }

    async fn exists(&self) -> Result<bool, RuntimeError> {
        match self.cli.run(["inspect", "--type", "container", self.name()]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self) -> Result<(), RuntimeError> {
        let publish = format!("{}:80", self.config.host_port);
        let mount = format!("{}:/etc/nginx/conf.d:ro", self.config.config_dir.display());

        self.cli
            .run([
                "run",
                "-d",
                "--name",
                self.name(),
                "--label",
                "dev.fork.role=proxy",
                "-p",
                publish.as_str(),
                "-v",
                mount.as_str(),
                self.config.image.as_str(),
            ])
            .await?;

        info!(
            container = %self.name(),
            image = %self.config.image,
            port = self.config.host_port,
            "Proxy container created"
        );
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for DockerProxy {
    async fn is_running(&self) -> Result<bool, RuntimeError> {
        match self
            .cli
            .run(["inspect", "--type", "container", "--format", "{{.State.Running}}", self.name()])
            .await
        {
            Ok(out) => Ok(out.trim() == "true"),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        if self.exists().await? {
            self.cli.run(["start", self.name()]).await?;
            debug!(container = %self.name(), "Proxy container started");
            Ok(())
        } else {
            self.create().await
        }
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        match self.cli.run(["stop", self.name()]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self) -> Result<(), RuntimeError> {
        match self.cli.run(["rm", "-f", self.name()]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reload(&self) -> Result<(), RuntimeError> {
        self.cli
            .run(["exec", self.name(), "nginx", "-s", "reload"])
            .await
            .map(|_| ())
    }

    async fn restart(&self) -> Result<(), RuntimeError> {
        if self.exists().await? {
            self.cli.run(["restart", self.name()]).await.map(|_| ())
        } else {
            self.create().await
        }
    }

    async fn check_health(&self) -> Result<(), RuntimeError> {
        if !self.is_running().await? {
            return Err(RuntimeError::Unavailable(format!(
                "proxy container {} is not running",
                self.name()
            )));
        }

        let url = format!("http://127.0.0.1{HEALTH_PATH}");
        self.cli
            .run(["exec", self.name(), "wget", "-q", "-O", "-", url.as_str()])
            .await
            .map(|_| ())
    }

    async fn connect_network(&self, network: &str) -> Result<(), RuntimeError> {
        match self.cli.run(["network", "connect", network, self.name()]).await {
            Ok(_) => {
                debug!(network = %network, "Proxy attached to network");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn disconnect_network(&self, network: &str) -> Result<(), RuntimeError> {
        match self
            .cli
            .run(["network", "disconnect", network, self.name()])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(RuntimeError::Command { stderr, .. })
                if stderr.to_ascii_lowercase().contains("is not connected") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
