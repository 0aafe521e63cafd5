//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Reads newline-delimited JSON request frames
//! - Routes each request to the registry, discovery, store or proxy
//! - Writes exactly one response per request, echoing the request id
//!
//! Client mistakes (bad JSON, oversized frames, unknown types, bad
//! payloads, unknown sessions) are answered with an error response and the
//! connection stays open. Only I/O failures end the connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use fork_protocol::{
    DiscoveryPayload, ErrorCode, HealthPayload, RefreshAllPayload, RefreshPayload,
    RegisterPayload, Request, RequestKind, Response, SessionRef,
};

use crate::discovery::DiscoveryError;
use crate::registry::{RegistryError, RemovalReason};

use super::ServerContext;

/// Maximum frame size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One decoded frame.
enum Frame {
    Request(Request),
    /// Frame could not be decoded; carries the id if one was recoverable
    Invalid { id: String, message: String },
    TooLarge,
    Blank,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    context: ServerContext,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: ServerContext,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            context,
            connection_number,
        }
    }

    /// Processes requests until the client disconnects.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "Client connected");

        match self.process_messages().await {
            Ok(()) | Err(ConnectionError::Eof) => {}
            Err(e) => debug!(
                connection = self.connection_number,
                error = %e,
                "Connection closed"
            ),
        }

        debug!(connection = self.connection_number, "Client disconnected");
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let response = match self.read_frame().await? {
                Frame::Request(request) => self.dispatch(request).await,
                Frame::Invalid { id, message } => {
                    warn!(connection = self.connection_number, error = %message, "Malformed frame");
                    Response::error(id, ErrorCode::ParseError, message)
                }
                Frame::TooLarge => {
                    warn!(connection = self.connection_number, "Oversized frame");
                    Response::error(
                        "",
                        ErrorCode::ParseError,
                        format!("message exceeds {MAX_MESSAGE_SIZE} bytes"),
                    )
                }
                Frame::Blank => continue,
            };

            self.send_response(&response).await?;
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&self, request: Request) -> Response {
        debug!(
            connection = self.connection_number,
            kind = ?request.kind,
            request_id = %request.id,
            "Received request"
        );

        match request.kind {
            RequestKind::RegisterSession => self.handle_register(&request).await,
            RequestKind::UnregisterSession => self.handle_unregister(&request).await,
            RequestKind::ListSessions => {
                let sessions = self.context.registry.list().await;
                Response::session_list(request.id, sessions.as_ref().clone())
            }
            RequestKind::GetSessionInfo => {
                let target = match request.payload_as::<SessionRef>() {
                    Ok(r) => r,
                    Err(e) => return invalid_payload(&request, e),
                };
                match self.context.registry.get(&target.session_id).await {
                    Ok(session) => Response::session_info(request.id, &session),
                    Err(e) => registry_error(&request, e),
                }
            }
            RequestKind::RefreshSession => {
                let target = match request.payload_as::<SessionRef>() {
                    Ok(r) => r,
                    Err(e) => return invalid_payload(&request, e),
                };
                match self
                    .context
                    .discovery
                    .refresh_session(&target.session_id)
                    .await
                {
                    Ok(status) => Response::success(request.id, &RefreshPayload { status }),
                    Err(e) => discovery_error(&request, e),
                }
            }
            RequestKind::RefreshAll => match self.context.discovery.refresh_all().await {
                Ok(report) => Response::success(
                    request.id,
                    &RefreshAllPayload {
                        discovered: report.discovered,
                        failed: report.failed,
                        removed: report.removed,
                    },
                ),
                Err(e) => discovery_error(&request, e),
            },
            RequestKind::RequestNextId => {
                Response::next_id(request.id, self.context.store.next_id())
            }
            RequestKind::HealthCheck => Response::success(
                request.id,
                &HealthPayload {
                    status: "ok".to_string(),
                    sessions: self.context.registry.len().await,
                    uptime_secs: self.context.started_at.elapsed().as_secs(),
                },
            ),
            RequestKind::TriggerDiscovery => match self.context.discovery.sweep().await {
                Ok(report) => Response::success(
                    request.id,
                    &DiscoveryPayload {
                        discovered: report.discovered,
                        failed: report.failed,
                    },
                ),
                Err(e) => discovery_error(&request, e),
            },
            RequestKind::GetVersion => Response::version_info(request.id, &self.context.version),
            RequestKind::Unknown => Response::error(
                request.id,
                ErrorCode::UnknownType,
                "unknown request type",
            ),
        }
    }

    async fn handle_register(&self, request: &Request) -> Response {
        let payload = match request.payload_as::<RegisterPayload>() {
            Ok(p) => p,
            Err(e) => return invalid_payload(request, e),
        };
        let session = match payload.into_session() {
            Ok(s) => s,
            Err(e) => {
                return Response::error(request.id.clone(), ErrorCode::InvalidPayload, e.to_string())
            }
        };
        let session_id = session.id.clone();

        let outcome = self.context.registry.register(session).await;
        self.context.discovery.attach_network(&session_id).await;

        // The write is attempted before replying; the reload converges later.
        if let Err(e) = self.context.proxy().apply().await {
            error!(session_id = %session_id, error = %e, "Failed to write proxy configuration");
        }

        info!(session_id = %session_id, outcome = ?outcome, "Session registered by client");
        Response::success(
            request.id.clone(),
            &json!({ "status": "ok", "session_id": session_id }),
        )
    }

    async fn handle_unregister(&self, request: &Request) -> Response {
        let target = match request.payload_as::<SessionRef>() {
            Ok(r) => r,
            Err(e) => return invalid_payload(request, e),
        };

        match self
            .context
            .discovery
            .retire_session(&target.session_id, RemovalReason::Explicit)
            .await
        {
            Ok(_) => Response::success(request.id.clone(), &json!({ "status": "ok" })),
            Err(e) => registry_error(request, e),
        }
    }

    // ========================================================================
    // Framing
    // ========================================================================

    /// Reads one newline-terminated frame of at most `MAX_MESSAGE_SIZE`
    /// bytes. The remainder of an oversized frame is discarded.
    async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        let mut buf = Vec::new();
        let limit = MAX_MESSAGE_SIZE as u64 + 1;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if buf.last() != Some(&b'\n') && buf.len() > MAX_MESSAGE_SIZE {
            self.discard_line().await?;
            return Ok(Frame::TooLarge);
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(Frame::Blank);
        }

        Ok(decode_frame(&buf))
    }

    async fn discard_line(&mut self) -> Result<(), ConnectionError> {
        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?;
            if available.is_empty() {
                return Err(ConnectionError::Eof);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    async fn send_response(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(response)
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;

        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Decodes a frame, recovering the request id from a malformed request
/// when the frame is at least a JSON object.
fn decode_frame(bytes: &[u8]) -> Frame {
    match serde_json::from_slice::<Request>(bytes) {
        Ok(request) => Frame::Request(request),
        Err(e) => {
            let id = serde_json::from_slice::<Value>(bytes)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            Frame::Invalid {
                id,
                message: format!("invalid request: {e}"),
            }
        }
    }
}

fn invalid_payload(request: &Request, error: serde_json::Error) -> Response {
    Response::error(
        request.id.clone(),
        ErrorCode::InvalidPayload,
        format!("invalid payload for {:?}: {error}", request.kind),
    )
}

fn registry_error(request: &Request, error: RegistryError) -> Response {
    match error {
        RegistryError::SessionNotFound(_) => {
            Response::error(request.id.clone(), ErrorCode::NotFound, error.to_string())
        }
    }
}

fn discovery_error(request: &Request, error: DiscoveryError) -> Response {
    match error {
        DiscoveryError::Registry(e) => registry_error(request, e),
        other => {
            error!(request_id = %request.id, error = %other, "Request failed");
            Response::error(request.id.clone(), ErrorCode::Internal, other.to_string())
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Write timeout")]
    WriteTimeout,
}
