//! Error taxonomy for the listener.
//!
//! # Design Decisions
//! - One error kind for handlers and store collaborators
//! - Every variant carries its HTTP status and CouchDB error name
//! - Transport failures are never errors: writers report `false`

use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors raised by request handlers and the collaborators they call.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Resource does not exist. The payload is the CouchDB reason ("missing", "no_db_file", ...).
    #[error("not found: {0}")]
    NotFound(String),

    /// Document exists but its winning revision is a deletion.
    #[error("document deleted")]
    Deleted,

    /// Update conflicts with the current revision.
    #[error("document update conflict")]
    Conflict,

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Malformed or out-of-range query parameter.
    #[error("invalid parameter: {0}")]
    BadParam(String),

    /// Invalid database or document identifier.
    #[error("invalid id: {0}")]
    BadId(String),

    /// Request body is not valid JSON.
    #[error("invalid JSON body: {0}")]
    BadJson(#[from] serde_json::Error),

    /// Attachment body was missing or unreadable.
    #[error("bad attachment: {0}")]
    BadAttachment(String),

    /// Operation refused (read-only mode, limits).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource already exists.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Client demands a representation we cannot produce.
    #[error("not acceptable")]
    NotAcceptable,

    /// Request body exceeds the configured limit.
    #[error("request body too large")]
    RequestTooLarge,

    /// Feature not supported by the configured collaborator.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for handler and store operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

impl ListenerError {
    /// Shorthand for the common "missing" reason.
    pub fn missing() -> Self {
        Self::NotFound("missing".to_string())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::Deleted => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::BadRequest(_)
            | Self::BadParam(_)
            | Self::BadId(_)
            | Self::BadJson(_)
            | Self::BadAttachment(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// CouchDB-style error name.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::Deleted => "not_found",
            Self::Conflict => "conflict",
            Self::BadRequest(_) | Self::BadParam(_) | Self::BadId(_) | Self::BadJson(_) => {
                "bad_request"
            }
            Self::BadAttachment(_) => "bad_attachment",
            Self::Forbidden(_) => "forbidden",
            Self::PreconditionFailed(_) => "file_exists",
            Self::NotAcceptable => "not_acceptable",
            Self::RequestTooLarge => "too_large",
            Self::NotImplemented(_) => "not_implemented",
            Self::Internal(_) => "internal_server_error",
        }
    }

    /// Human readable reason placed in the error body.
    pub fn reason(&self) -> String {
        match self {
            Self::NotFound(reason) => reason.clone(),
            Self::Deleted => "deleted".to_string(),
            Self::Conflict => "Document update conflict.".to_string(),
            Self::BadJson(e) => format!("invalid UTF-8 JSON: {}", e),
            Self::BadRequest(r)
            | Self::BadParam(r)
            | Self::BadId(r)
            | Self::BadAttachment(r)
            | Self::Forbidden(r)
            | Self::PreconditionFailed(r)
            | Self::NotImplemented(r)
            | Self::Internal(r) => r.clone(),
            Self::NotAcceptable => "no acceptable representation".to_string(),
            Self::RequestTooLarge => "request body exceeds the configured limit".to_string(),
        }
    }

    /// JSON error body, `{"status":N,"error":"...","reason":"..."}`.
    pub fn body(&self) -> Value {
        json!({
            "status": self.status().as_u16(),
            "error": self.error_name(),
            "reason": self.reason(),
        })
    }

    /// Error body for a bare status code with no richer error attached.
    pub fn body_for_status(status: StatusCode) -> Value {
        json!({
            "status": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("unknown").to_lowercase().replace(' ', "_"),
            "reason": status.canonical_reason().unwrap_or("unknown"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ListenerError::missing().status(), StatusCode::NOT_FOUND);
        assert_eq!(ListenerError::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            ListenerError::BadParam("heartbeat".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ListenerError::PreconditionFailed("exists".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
    }

    #[test]
    fn error_body_shape() {
        let body = ListenerError::Deleted.body();
        assert_eq!(body["status"], 404);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["reason"], "deleted");
    }

    #[test]
    fn bare_status_body() {
        let body = ListenerError::body_for_status(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["status"], 405);
        assert_eq!(body["error"], "method_not_allowed");
    }
}
