//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, decoded path segments)
//!     → table.rs (pick the method's trie, HEAD → GET)
//!     → trie.rs (literal > regex > wildcard > greedy)
//!     → router.rs (access check, handler, 404/405 probe)
//!     → Return: ResponseState
//!
//! Route Compilation (at startup):
//!     RouteDef[] (method, pattern, handler)
//!     → pattern.rs (parse segments, compile regexes)
//!     → Insert into per-method tries
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Pattern errors fail startup instead of the first request
//! - Deterministic: same input always matches same route

pub mod pattern;
pub mod router;
pub mod table;
pub mod trie;

pub use pattern::RouteError;
pub use router::{BodyMode, Handler, Route, Router};
pub use table::{RouteDef, RouteTable};
