//! fork protocol - wire protocol for the daemon control socket
//!
//! Clients send newline-delimited JSON [`Request`] frames and receive
//! exactly one [`Response`] per request, echoing the request `id`.

pub mod message;
pub mod payload;
pub mod version;

pub use message::{ErrorCode, Request, RequestKind, Response, ResponseKind};
pub use payload::{
    DiscoveryPayload, ErrorPayload, HealthPayload, NextIdPayload, RefreshAllPayload,
    RefreshPayload, RefreshStatus, RegisterPayload, SessionListPayload, SessionRef,
    VersionPayload,
};
pub use version::ProtocolVersion;
