//! fork daemon - session registry, container discovery and proxy control
//!
//! This crate provides the core infrastructure of the fork daemon:
//! - `registry` - in-memory session registry with a list snapshot cache
//! - `server` - Unix socket server for client connections
//! - `discovery` - reconciliation of the registry with the container runtime
//! - `proxy` - nginx configuration rendering, reload and self-healing
//! - `runtime` - container runtime access (docker CLI)
//! - `singleton` - single-instance enforcement via the PID record
//! - `store` - persistent sequential-id counter
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         forkd daemon                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐        ┌────────────────────────────┐   │
//! │  │  DaemonServer   │───────▶│  Registry                  │   │
//! │  │ (Unix Socket)   │        │  (session state owner)     │   │
//! │  └────────┬────────┘        └─────────────▲──────────────┘   │
//! │           │                               │ reconcile        │
//! │           │ register/unregister   ┌───────┴──────────────┐   │
//! │           │                       │  DiscoveryService    │   │
//! │           │                       │  sweep/events/valid. │   │
//! │           ▼                       └───────┬──────────────┘   │
//! │  ┌─────────────────┐                      │                  │
//! │  │ProxyConfigurator│◀─────────────────────┘                  │
//! │  │ render/reload   │──────▶ nginx container                  │
//! │  └─────────────────┘                                         │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Loop iterations that fail are logged and retried on the next tick

pub mod atomic;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod singleton;
pub mod store;
