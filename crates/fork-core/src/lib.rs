//! fork core - shared types for container-backed development sessions
//!
//! This crate provides the domain types shared between the daemon
//! (forkd) and its clients.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod labels;
pub mod naming;
pub mod session;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use naming::{hostname, is_valid_name, network_name, sanitize_dns_label, upstream_host};
pub use session::{Service, Session, SessionId, DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_PORT};
