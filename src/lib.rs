//! CouchDB-compatible listener for peer-to-peer replication.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ net::listener ──▶ http::server ──▶ routing::router ──▶ handlers
//!                                                                              │
//!                                                                              ▼
//!                                                                     lifecycle::state
//!                                                          Immediate │ OneShot │ Feed
//!                                                                              │
//!     Client Response                                                          ▼
//!     ◀────────────── http::writer ◀── http::response ◀──────── feed::subscription
//!
//!     Cross-cutting: config, observability, security, lifecycle (registry, shutdown)
//!     Collaborators: store (databases, replicator)
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod security;
pub mod store;

pub use config::ServerConfig;
pub use error::{ListenerError, ListenerResult};
pub use http::{ListenerServer, ListenerState};
pub use lifecycle::Shutdown;
