//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID, body buffering)
//!     → request.rs (decoded path segments, query, negotiation headers)
//!     → [routing layer picks a handler]
//!     → response.rs (status, headers, ranges, chunked writes)
//!     → writer.rs (bytes onto the wire)
//!     → Send to client
//! ```

pub mod multipart;
pub mod range;
pub mod request;
pub mod response;
pub mod server;
pub mod writer;

pub use request::{RequestBody, RequestContext, X_REQUEST_ID};
pub use response::{Response, ResponseBody};
pub use server::{build_app, ListenerServer, ListenerState, ServerError};
pub use writer::{ChannelWriter, MemoryWriter, ResponseWriter};
