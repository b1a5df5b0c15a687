//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Reply (state.rs):
//!     Handler → ResponseState → start(writer) → Immediate | OneShot task | Feed task
//!
//! Pending replies (registry.rs):
//!     register on start → unregister exactly once on completion or failure
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Feeds close → Registry drains → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Shutdown has a timeout: open replies are abandoned after the drain deadline

pub mod registry;
pub mod shutdown;
pub mod signals;
pub mod state;

pub use registry::{PendingKind, PendingResponses, Registration};
pub use shutdown::Shutdown;
pub use state::ResponseState;
