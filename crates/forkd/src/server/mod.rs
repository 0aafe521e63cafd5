//! Unix socket server for the fork daemon.
//!
//! The server:
//! - Listens on a Unix socket restricted to its owner
//! - Spawns a ConnectionHandler for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌──────────────────────────────┐
//! │ConnectionHandler│────▶│ ServerContext                │
//! │   (per client)  │     │  Registry / StateStore /     │
//! └─────────────────┘     │  DiscoveryService (+ proxy)  │
//!                         └──────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and the server keeps accepting

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::DiscoveryService;
use crate::proxy::ProxyConfigurator;
use crate::registry::Registry;
use crate::store::StateStore;

/// Everything a connection handler needs, cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Registry,
    pub store: StateStore,
    pub discovery: DiscoveryService,
    pub started_at: Instant,
    pub version: String,
}

impl ServerContext {
    pub fn new(registry: Registry, store: StateStore, discovery: DiscoveryService) -> Self {
        Self {
            registry,
            store,
            discovery,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn proxy(&self) -> &ProxyConfigurator {
        self.discovery.proxy()
    }
}

/// Unix socket server for the fork daemon.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    context: ServerContext,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for log correlation
    connection_counter: AtomicU64,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        context: ServerContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            context,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket, replacing a stale socket file, and restricts it
    /// to owner read/write.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SocketSetup` if the socket cannot be created.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(setup_error)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(setup_error)?;

        info!(socket = %self.socket_path.display(), "Daemon server listening");
        Ok(listener)
    }

    /// Accepts connections on an already bound listener until the
    /// cancellation token fires.
    ///
    /// The socket file is left in place; the owner decides whether to
    /// call [`DaemonServer::remove_socket`].
    pub async fn serve(&self, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!("Server stopped accepting connections");
    }

    /// Spawns a handler task for a new connection.
    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let context = self.context.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(reader, writer, context, connection_number);
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(connection = connection_number, "Dropping connection on shutdown");
                }
                _ = handler.run() => {}
            }
        });
    }

    /// Removes the socket file.
    pub fn remove_socket(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        debug!(socket = %self.socket_path.display(), "Socket removed");
    }
}

/// Errors from the daemon server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }
}
