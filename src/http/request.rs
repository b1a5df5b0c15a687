//! Request context handed to route handlers.
//!
//! # Responsibilities
//! - Split and percent-decode the path into routing segments
//! - Parse the query string once
//! - Hold the request body, buffered or (for upload routes) as a stream
//! - Build a [`Response`] that knows the request's negotiation headers
//!
//! # Design Decisions
//! - Request ID is assigned by the HTTP layer before the context exists
//! - Handlers reach collaborators through the context, never through globals

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::{ListenerError, ListenerResult};
use crate::http::response::{RequestInfo, Response};
use crate::http::server::ListenerState;
use crate::routing::pattern::split_path;
use crate::store::Database;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Request body as the handler sees it.
pub enum RequestBody {
    Buffered(Bytes),
    /// Left unread for the handler; `None` once taken.
    Stream(Option<Body>),
}

/// Everything a handler may look at.
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub segments: Vec<String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    body: RequestBody,
    state: ListenerState,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: &str,
        raw_query: Option<&str>,
        headers: HeaderMap,
        body: RequestBody,
        state: ListenerState,
    ) -> Self {
        let request_id = headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        Self {
            request_id,
            method,
            path: path.to_string(),
            segments: decode_segments(path),
            query: parse_query(raw_query),
            headers,
            body,
            state,
        }
    }

    pub fn state(&self) -> &ListenerState {
        &self.state
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.state.config.load_full()
    }

    /// Decoded path segment `i`.
    pub fn segment(&self, i: usize) -> Option<&str> {
        self.segments.get(i).map(String::as_str)
    }

    /// Decoded path segments from `i` on, joined with `/`.
    pub fn rest_of_path(&self, i: usize) -> String {
        self.segments.get(i..).map(|s| s.join("/")).unwrap_or_default()
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// `true` for `true` or `1`.
    pub fn query_bool(&self, name: &str) -> bool {
        matches!(self.query(name), Some("true") | Some("1"))
    }

    /// Integer parameter, `default` when absent or unparsable.
    pub fn query_int(&self, name: &str, default: u64) -> u64 {
        self.query(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Parameter holding JSON (`open_revs=["1-a"]`, `keys=[...]`).
    pub fn query_json(&self, name: &str) -> ListenerResult<Option<Value>> {
        self.query(name)
            .map(|raw| serde_json::from_str(raw).map_err(ListenerError::from))
            .transpose()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            RequestBody::Buffered(bytes) => bytes.clone(),
            RequestBody::Stream(_) => Bytes::new(),
        }
    }

    /// Parse the buffered body as JSON.
    pub fn body_json(&self) -> ListenerResult<Value> {
        let bytes = self.body_bytes();
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ListenerError::BadJson(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "empty request body",
            ))));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read a still-unread body into memory.
    ///
    /// Fails with `413` past `limit` bytes or when the body cannot be read.
    pub async fn buffer_body(&mut self, limit: usize) -> ListenerResult<()> {
        let RequestBody::Stream(body) = &mut self.body else {
            return Ok(());
        };
        let bytes = match body.take() {
            Some(body) => axum::body::to_bytes(body, limit)
                .await
                .map_err(|_| ListenerError::RequestTooLarge)?,
            None => Bytes::new(),
        };
        self.body = RequestBody::Buffered(bytes);
        Ok(())
    }

    /// Take the unread body of a streamed route.
    pub fn take_body_stream(&mut self) -> Option<Body> {
        match &mut self.body {
            RequestBody::Stream(body) => body.take(),
            RequestBody::Buffered(bytes) => Some(Body::from(bytes.clone())),
        }
    }

    /// Negotiation headers of this request.
    pub fn request_info(&self) -> RequestInfo {
        let owned = |name: &str| self.header(name).map(str::to_string);
        RequestInfo {
            method: self.method.clone(),
            accept: owned(header::ACCEPT.as_str()),
            range: owned(header::RANGE.as_str()),
            if_none_match: owned(header::IF_NONE_MATCH.as_str()),
        }
    }

    /// Fresh reply for this request.
    pub fn response(&self) -> Response {
        Response::new(self.request_info())
    }

    /// Database named by path segment 0.
    pub fn database(&self) -> ListenerResult<Arc<dyn Database>> {
        let name = self.segment(0).ok_or_else(ListenerError::missing)?;
        self.state.manager.database(name)
    }

    /// Revision the client is updating: `?rev=`, then `If-Match`.
    pub fn requested_rev(&self) -> Option<String> {
        self.query("rev")
            .map(str::to_string)
            .or_else(|| self.header("if-match").map(|v| v.trim_matches('"').to_string()))
    }
}

fn decode_segments(path: &str) -> Vec<String> {
    split_path(path)
        .into_iter()
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect()
}

/// Parse `a=1&b=two`. Later duplicates win.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    raw.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_are_decoded() {
        assert_eq!(
            decode_segments("/db/doc%2Fwith%20slash/att/name.txt"),
            vec!["db", "doc/with slash", "att", "name.txt"]
        );
        assert!(decode_segments("/").is_empty());
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("feed=longpoll&since=4&open_revs=%5B%221-a%22%5D"));
        assert_eq!(q["feed"], "longpoll");
        assert_eq!(q["since"], "4");
        assert_eq!(q["open_revs"], "[\"1-a\"]");
        assert!(parse_query(None).is_empty());
    }
}
