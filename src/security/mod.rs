//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (read-only mode)
//!     → Pass to handler, or reject with 403
//! ```
//!
//! # Design Decisions
//! - Checked on every request against the live config, so a reload applies immediately
//! - Fail closed: reject on any check failure

pub mod access_control;

pub use access_control::{AccessCheck, ReadOnlyAccess};
