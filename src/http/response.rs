//! The Response object.
//!
//! # Responsibilities
//! - Hold status, ordered headers and exactly one body variant
//! - Write the head once, adding default headers first
//! - Negotiate JSON representations against `Accept`
//! - Apply single `Range` requests to binary bodies
//! - Stream chunks once chunked mode was chosen before the head went out
//!
//! # Data Flow
//! ```text
//! handler builds Response (no transport yet)
//!     → lifecycle attaches a ResponseWriter
//!     → write_headers() → prepare(): default body, negotiation, ranges, length
//!     → write_body()  |  write_chunk()* → close()
//! ```
//!
//! # Design Decisions
//! - Setting a body replaces the previous one (the body is an enum)
//! - `chunked` is frozen once the head is written
//! - Every write reports success as `bool`; after `close()` all writes fail

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::ListenerError;
use crate::http::multipart::MultipartWriter;
use crate::http::range::{self, RangeOutcome};
use crate::http::writer::ResponseWriter;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = concat!("CouchLite/", env!("CARGO_PKG_VERSION"), " (Rust)");

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// The parts of the request a reply depends on.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub accept: Option<String>,
    pub range: Option<String>,
    pub if_none_match: Option<String>,
}

impl RequestInfo {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            accept: None,
            range: None,
            if_none_match: None,
        }
    }
}

/// Body of a reply.
#[derive(Debug, Clone, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Json(Value),
    Binary(Bytes),
    Multipart(MultipartWriter),
    /// Bytes are pushed later with `write_chunk`.
    Streaming,
}

/// One HTTP reply.
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: ResponseBody,
    chunked: bool,
    request: RequestInfo,
    encoded: Option<Bytes>,
    head_result: Option<bool>,
    body_written: bool,
    finished: bool,
    writer: Option<Box<dyn ResponseWriter>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("chunked", &self.chunked)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Response {
    pub fn new(request: RequestInfo) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: ResponseBody::Empty,
            chunked: false,
            request,
            encoded: None,
            head_result: None,
            body_written: false,
            finished: false,
            writer: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.headers_written() {
            tracing::debug!(status = %status, "Status change after head was written ignored");
            return;
        }
        self.status = status;
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_json(&mut self, value: Value) {
        self.body = ResponseBody::Json(value);
    }

    pub fn set_binary(&mut self, data: Bytes, content_type: &str) {
        self.set_header("Content-Type", content_type);
        self.body = ResponseBody::Binary(data);
    }

    pub fn set_multipart(&mut self, writer: MultipartWriter) {
        self.set_header("Content-Type", writer.content_type());
        self.body = ResponseBody::Multipart(writer);
    }

    /// Replace status and body with the CouchDB error shape for `err`.
    pub fn set_error(&mut self, err: &ListenerError) {
        self.set_status(err.status());
        self.remove_header("Content-Type");
        self.body = ResponseBody::Json(err.body());
    }

    /// Replace status and body with a generic error for `status`.
    pub fn set_error_status(&mut self, status: StatusCode) {
        self.set_status(status);
        self.remove_header("Content-Type");
        self.body = ResponseBody::Json(ListenerError::body_for_status(status));
    }

    /// Switch chunked streaming on or off. Fails once the head is out.
    pub fn set_chunked(&mut self, chunked: bool) -> bool {
        if self.headers_written() {
            return false;
        }
        self.chunked = chunked;
        if chunked {
            self.body = ResponseBody::Streaming;
        } else if matches!(self.body, ResponseBody::Streaming) {
            self.body = ResponseBody::Empty;
        }
        true
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn headers_written(&self) -> bool {
        self.head_result.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Set `Etag` and report whether the client already holds this version.
    /// On a match the reply becomes a bodiless 304.
    pub fn cache_with_etag(&mut self, tag: &str) -> bool {
        let quoted = format!("\"{}\"", tag);
        self.set_header("Etag", quoted.clone());

        let matched = self.request.if_none_match.as_deref().is_some_and(|header| {
            header
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate == quoted || candidate == tag)
        });
        if matched {
            self.status = StatusCode::NOT_MODIFIED;
            self.body = ResponseBody::Empty;
        }
        matched
    }

    /// Give the reply its transport.
    pub fn attach(&mut self, writer: Box<dyn ResponseWriter>) {
        self.writer = Some(writer);
    }

    /// Finalize the body representation before the head goes out.
    fn prepare(&mut self) {
        let is_read = matches!(self.request.method, Method::GET | Method::HEAD);

        if self.chunked {
            if self.header("Content-Type").is_none() {
                self.set_header("Content-Type", CONTENT_TYPE_JSON);
            }
            return;
        }

        if matches!(self.body, ResponseBody::Empty) {
            let code = self.status.as_u16();
            if self.status.is_success() && code != 204 {
                self.body = ResponseBody::Json(json!({"ok": true}));
            } else if code >= 400 && code != 416 {
                self.body = ResponseBody::Json(ListenerError::body_for_status(self.status));
            }
        }

        let encoded = match std::mem::take(&mut self.body) {
            ResponseBody::Json(value) => {
                let negotiated = match self.header("Content-Type") {
                    Some(explicit) if accepts(self.request.accept.as_deref(), explicit) => {
                        Some(explicit.to_string())
                    }
                    Some(_) => None,
                    None => negotiate_json(self.request.accept.as_deref()).map(str::to_string),
                };
                let value = match negotiated {
                    Some(content_type) => {
                        self.set_header("Content-Type", content_type);
                        value
                    }
                    None => {
                        let err = ListenerError::NotAcceptable;
                        self.status = err.status();
                        self.set_header("Content-Type", CONTENT_TYPE_JSON);
                        err.body()
                    }
                };
                let bytes = Bytes::from(value.to_string());
                self.body = ResponseBody::Json(value);
                bytes
            }
            ResponseBody::Binary(data) => {
                let mut out = data.clone();
                if is_read {
                    self.set_header("Accept-Ranges", "bytes");
                    if self.status == StatusCode::OK {
                        match range::evaluate(self.request.range.as_deref(), data.len()) {
                            RangeOutcome::Full => {}
                            RangeOutcome::Partial { start, end } => {
                                self.status = StatusCode::PARTIAL_CONTENT;
                                self.set_header(
                                    "Content-Range",
                                    range::content_range(start, end, data.len()),
                                );
                                out = data.slice(start..=end);
                            }
                            RangeOutcome::Unsatisfiable => {
                                self.status = StatusCode::RANGE_NOT_SATISFIABLE;
                                self.set_header(
                                    "Content-Range",
                                    range::unsatisfiable_range(data.len()),
                                );
                                out = Bytes::new();
                            }
                        }
                    }
                }
                self.body = ResponseBody::Binary(data);
                out
            }
            ResponseBody::Multipart(writer) => {
                let bytes = writer.to_bytes();
                self.set_header("Content-Type", writer.content_type());
                self.body = ResponseBody::Multipart(writer);
                bytes
            }
            other => {
                self.body = other;
                Bytes::new()
            }
        };

        if self.status != StatusCode::NOT_MODIFIED {
            self.set_header("Content-Length", encoded.len().to_string());
        }
        self.encoded = Some(encoded);
    }

    /// Write status and headers. Idempotent: later calls return the first result.
    pub fn write_headers(&mut self) -> bool {
        if let Some(result) = self.head_result {
            return result;
        }
        if self.finished {
            return false;
        }

        self.prepare();

        let mut headers = vec![("Server".to_string(), SERVER_NAME.to_string())];
        let is_read = matches!(self.request.method, Method::GET | Method::HEAD);
        if self.status == StatusCode::OK
            && is_read
            && self.header("Cache-Control").is_none()
        {
            headers.push(("Cache-Control".to_string(), "must-revalidate".to_string()));
        }
        headers.extend(self.headers.iter().cloned());

        let result = match self.writer.as_mut() {
            Some(writer) => writer.write_head(self.status, &headers),
            None => false,
        };
        self.head_result = Some(result);
        result
    }

    /// Write the buffered body. No-op for chunked replies and HEAD requests.
    pub fn write_body(&mut self) -> bool {
        if !self.write_headers() {
            return false;
        }
        if self.chunked || self.body_written {
            return true;
        }
        self.body_written = true;

        let data = self.encoded.take().unwrap_or_default();
        if self.request.method == Method::HEAD || data.is_empty() {
            return true;
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => false,
        }
    }

    /// Write head and body, then close.
    pub fn send(&mut self) -> bool {
        let ok = self.write_headers() && self.write_body();
        self.close();
        ok
    }

    /// Write one chunk of a chunked reply. `is_final` closes afterwards.
    pub fn write_chunk(&mut self, data: Bytes, is_final: bool) -> bool {
        if !self.chunked || self.finished {
            return false;
        }
        if !self.write_headers() {
            self.close();
            return false;
        }
        let ok = match self.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => false,
        };
        if is_final {
            self.close();
        }
        ok
    }

    /// Finish the reply. Safe to call more than once.
    pub fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(writer) = self.writer.as_mut() {
            writer.close();
        }
    }
}

/// Pick a JSON content type for `Accept`, or `None` if nothing fits.
pub fn negotiate_json(accept: Option<&str>) -> Option<&'static str> {
    let accept = match accept.map(str::trim) {
        None | Some("") => return Some(CONTENT_TYPE_JSON),
        Some(a) => a,
    };
    let ranges: Vec<&str> = media_ranges(accept).collect();
    if ranges
        .iter()
        .any(|r| matches!(*r, "*/*" | "application/*" | "application/json"))
    {
        Some(CONTENT_TYPE_JSON)
    } else if ranges.iter().any(|r| matches!(*r, "text/*" | "text/plain")) {
        Some(CONTENT_TYPE_TEXT)
    } else {
        None
    }
}

/// True when `accept` admits `content_type`.
pub fn accepts(accept: Option<&str>, content_type: &str) -> bool {
    let accept = match accept.map(str::trim) {
        None | Some("") => return true,
        Some(a) => a,
    };
    let wanted = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let major = wanted.split('/').next().unwrap_or_default().to_string();

    media_ranges(accept).any(|r| {
        r == "*/*" || r == wanted || r.strip_suffix("/*").is_some_and(|m| m == major)
    })
}

/// True when the client explicitly asked for JSON (not via a wildcard).
pub fn explicitly_accepts_json(accept: Option<&str>) -> bool {
    accept.is_some_and(|a| media_ranges(a).any(|r| r == "application/json"))
}

fn media_ranges(accept: &str) -> impl Iterator<Item = &str> {
    accept
        .split(',')
        .filter_map(|r| r.split(';').next())
        .map(str::trim)
        .filter(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::writer::MemoryWriter;

    fn response(method: Method) -> (Response, MemoryWriter) {
        let writer = MemoryWriter::new();
        let mut response = Response::new(RequestInfo::new(method));
        response.attach(Box::new(writer.clone()));
        (response, writer)
    }

    #[test]
    fn test_write_headers_is_idempotent() {
        let (mut r, w) = response(Method::GET);
        r.set_json(json!({"a": 1}));
        assert!(r.write_headers());
        assert!(r.write_headers());
        assert_eq!(w.head_writes(), 1);
    }

    #[test]
    fn test_default_headers() {
        let (mut r, w) = response(Method::GET);
        r.set_json(json!({"a": 1}));
        assert!(r.send());
        assert_eq!(w.header("Server").as_deref(), Some(SERVER_NAME));
        assert_eq!(w.header("Cache-Control").as_deref(), Some("must-revalidate"));
        assert_eq!(w.header("Content-Type").as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(w.body_string(), r#"{"a":1}"#);
        assert!(w.is_closed());

        let (mut r, w) = response(Method::PUT);
        r.set_status(StatusCode::CREATED);
        assert!(r.send());
        assert!(w.header("Cache-Control").is_none());
        assert_eq!(w.body_string(), r#"{"ok":true}"#);
    }

    #[test]
    fn test_not_acceptable() {
        let mut info = RequestInfo::new(Method::GET);
        info.accept = Some("image/png".to_string());
        let writer = MemoryWriter::new();
        let mut r = Response::new(info);
        r.attach(Box::new(writer.clone()));
        r.set_json(json!({"a": 1}));
        r.send();

        assert_eq!(writer.status(), Some(StatusCode::NOT_ACCEPTABLE));
        let body: Value = serde_json::from_str(&writer.body_string()).unwrap();
        assert_eq!(body["status"], 406);
    }

    #[test]
    fn test_negotiation() {
        assert_eq!(negotiate_json(None), Some(CONTENT_TYPE_JSON));
        assert_eq!(negotiate_json(Some("*/*")), Some(CONTENT_TYPE_JSON));
        assert_eq!(
            negotiate_json(Some("text/html, text/plain;q=0.9")),
            Some(CONTENT_TYPE_TEXT)
        );
        assert_eq!(negotiate_json(Some("image/png")), None);
        assert!(accepts(Some("text/*"), "text/plain; charset=utf-8"));
        assert!(!accepts(Some("application/json"), "multipart/related"));
        assert!(explicitly_accepts_json(Some("application/json")));
        assert!(!explicitly_accepts_json(Some("*/*")));
    }

    #[test]
    fn test_range_partial() {
        let data = Bytes::from((0u8..100).collect::<Vec<u8>>());
        let mut info = RequestInfo::new(Method::GET);
        info.range = Some("bytes=50-".to_string());
        let writer = MemoryWriter::new();
        let mut r = Response::new(info);
        r.attach(Box::new(writer.clone()));
        r.set_binary(data, "application/octet-stream");
        r.send();

        assert_eq!(writer.status(), Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(writer.header("Content-Range").as_deref(), Some("bytes 50-99/100"));
        assert_eq!(writer.body().len(), 50);
        assert_eq!(writer.body()[0], 50);
    }

    #[test]
    fn test_range_unsatisfiable() {
        let mut info = RequestInfo::new(Method::GET);
        info.range = Some("bytes=150-".to_string());
        let writer = MemoryWriter::new();
        let mut r = Response::new(info);
        r.attach(Box::new(writer.clone()));
        r.set_binary(Bytes::from(vec![0u8; 100]), "application/octet-stream");
        r.send();

        assert_eq!(writer.status(), Some(StatusCode::RANGE_NOT_SATISFIABLE));
        assert_eq!(writer.header("Content-Range").as_deref(), Some("bytes */100"));
        assert!(writer.body().is_empty());
    }

    #[test]
    fn test_head_sends_length_without_body() {
        let (mut r, w) = response(Method::HEAD);
        r.set_binary(Bytes::from_static(b"12345"), "text/plain");
        r.send();
        assert_eq!(w.header("Content-Length").as_deref(), Some("5"));
        assert!(w.body().is_empty());
    }

    #[test]
    fn test_chunked_frozen_after_head() {
        let (mut r, w) = response(Method::GET);
        assert!(r.set_chunked(true));
        assert!(r.write_chunk(Bytes::from_static(b"one\n"), false));
        assert!(!r.set_chunked(false));
        assert!(r.write_chunk(Bytes::from_static(b"two\n"), true));
        assert!(!r.write_chunk(Bytes::from_static(b"three\n"), false));
        assert_eq!(w.body_string(), "one\ntwo\n");
        assert!(w.header("Content-Length").is_none());
        assert!(w.is_closed());
    }

    #[test]
    fn test_write_chunk_requires_chunked() {
        let (mut r, _w) = response(Method::GET);
        assert!(!r.write_chunk(Bytes::from_static(b"x"), false));
    }

    #[test]
    fn test_etag_match() {
        let mut info = RequestInfo::new(Method::GET);
        info.if_none_match = Some("\"9\"".to_string());
        let writer = MemoryWriter::new();
        let mut r = Response::new(info);
        r.attach(Box::new(writer.clone()));
        assert!(r.cache_with_etag("9"));
        r.send();
        assert_eq!(writer.status(), Some(StatusCode::NOT_MODIFIED));
        assert_eq!(writer.header("Etag").as_deref(), Some("\"9\""));
        assert!(writer.body().is_empty());
    }

    #[test]
    fn test_set_body_replaces_previous() {
        let (mut r, _w) = response(Method::GET);
        r.set_json(json!({"a": 1}));
        r.set_binary(Bytes::from_static(b"raw"), "text/plain");
        assert!(matches!(r.body(), ResponseBody::Binary(_)));
    }

    #[test]
    fn test_write_without_transport_fails() {
        let mut r = Response::new(RequestInfo::new(Method::GET));
        assert!(!r.send());
    }
}
