//! Changes feed subsystem.
//!
//! # Data Flow
//! ```text
//! GET/POST /{db}/_changes
//!     → options.rs (feed, since, limit, heartbeat, style, filter)
//!     → assemble.rs (qualifying revisions → rows → results body)
//!     → normal: Immediate reply
//!     → longpoll with results: Immediate reply
//!     → otherwise subscription.rs (one task per open feed)
//! ```
//!
//! # Design Decisions
//! - One code path builds rows for every mode; only framing differs
//! - Heartbeats below 5 s are raised to 5 s

pub mod assemble;
pub mod mode;
pub mod options;
pub mod subscription;

pub use assemble::{results_body, FeedSource};
pub use mode::FeedMode;
pub use options::{ChangesOptions, MIN_HEARTBEAT};
pub use subscription::{ChangeSubscription, CloseReason};
