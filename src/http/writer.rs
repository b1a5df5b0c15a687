//! Transport writers.
//!
//! # Responsibilities
//! - Define the narrow interface a [`Response`](crate::http::response::Response) writes through
//! - Bridge writes into an axum streaming body ([`ChannelWriter`])
//! - Record writes in memory for tests and embedders ([`MemoryWriter`])
//!
//! # Design Decisions
//! - Writes report `false` instead of erroring; a failed write means the peer is gone
//! - A peer that stays connected but stops reading counts as gone once its
//!   queued bytes reach the cap, so open feeds tear down instead of growing
//! - The head travels on a oneshot so the HTTP entry point can build the
//!   response as soon as headers are known, while the body keeps streaming

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::{mpsc, oneshot};

/// Transport for one HTTP reply.
pub trait ResponseWriter: Send {
    /// Send the status line and headers. Called at most once by `Response`.
    fn write_head(&mut self, status: StatusCode, headers: &[(String, String)]) -> bool;

    /// Send one body chunk and flush it.
    fn write(&mut self, data: Bytes) -> bool;

    /// Finish the reply. Later writes fail.
    fn close(&mut self);
}

/// Status and headers handed to the HTTP layer.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
}

/// Writer side of a channel-backed reply.
pub struct ChannelWriter {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::UnboundedSender<Bytes>>,
    queued: Arc<AtomicUsize>,
    max_queued: usize,
}

/// Reader side of a channel-backed reply, owned by the HTTP entry point.
pub struct ChannelReceiver {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
}

impl ChannelWriter {
    /// Create a connected writer/receiver pair.
    ///
    /// A write is refused while `max_queued` bytes or more are waiting to be
    /// read. A single chunk larger than the cap still goes through when the
    /// queue is below it, so buffered bodies of any size can be sent.
    pub fn pair(max_queued: usize) -> (Self, ChannelReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        (
            Self {
                head: Some(head_tx),
                body: Some(body_tx),
                queued: queued.clone(),
                max_queued,
            },
            ChannelReceiver {
                head: head_rx,
                body: body_rx,
                queued,
            },
        )
    }

    /// Bytes written but not yet taken by the HTTP layer.
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl ResponseWriter for ChannelWriter {
    fn write_head(&mut self, status: StatusCode, headers: &[(String, String)]) -> bool {
        match self.head.take() {
            Some(tx) => tx
                .send(ResponseHead {
                    status,
                    headers: headers.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn write(&mut self, data: Bytes) -> bool {
        if self.head.is_some() {
            return false;
        }
        let Some(tx) = &self.body else {
            return false;
        };
        if data.is_empty() {
            return !tx.is_closed();
        }
        if self.queued.load(Ordering::Acquire) >= self.max_queued {
            tracing::debug!(
                queued = self.queued.load(Ordering::Relaxed),
                max_queued = self.max_queued,
                "Peer not reading, refusing write"
            );
            self.body = None;
            return false;
        }
        let len = data.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        if tx.send(data).is_ok() {
            true
        } else {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            false
        }
    }

    fn close(&mut self) {
        self.head = None;
        self.body = None;
    }
}

impl ChannelReceiver {
    /// Wait for the head and build an HTTP response whose body streams the
    /// remaining chunks. Returns `None` if the writer was dropped before
    /// sending a head.
    pub async fn into_http(self) -> Option<axum::response::Response> {
        let head = self.head.await.ok()?;

        let queued = self.queued;
        let body_stream = stream::unfold(self.body, move |mut rx| {
            let queued = queued.clone();
            async move {
                let chunk = rx.recv().await?;
                queued.fetch_sub(chunk.len(), Ordering::AcqRel);
                Some((Ok::<Bytes, std::io::Error>(chunk), rx))
            }
        });

        let mut response = axum::response::Response::new(Body::from_stream(body_stream));
        *response.status_mut() = head.status;
        let headers = response.headers_mut();
        for (name, value) in &head.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!(header = %name, "Dropping invalid response header"),
            }
        }
        Some(response)
    }
}

/// Everything a [`MemoryWriter`] has seen.
#[derive(Debug, Default)]
struct MemoryRecord {
    status: Option<StatusCode>,
    headers: Vec<(String, String)>,
    head_writes: usize,
    chunks: Vec<Bytes>,
    writes: usize,
    closed: bool,
}

/// In-memory writer. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    record: Arc<Mutex<MemoryRecord>>,
    fail_after: Option<usize>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every body write after the first `n` succeed.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock()
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// How many times the head was written.
    pub fn head_writes(&self) -> usize {
        self.lock().head_writes
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        self.lock().chunks.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.lock().chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl ResponseWriter for MemoryWriter {
    fn write_head(&mut self, status: StatusCode, headers: &[(String, String)]) -> bool {
        let mut record = self.lock();
        if record.closed {
            return false;
        }
        record.head_writes += 1;
        record.status = Some(status);
        record.headers = headers.to_vec();
        true
    }

    fn write(&mut self, data: Bytes) -> bool {
        let fail_after = self.fail_after;
        let mut record = self.lock();
        if record.closed || fail_after.is_some_and(|n| record.writes >= n) {
            return false;
        }
        record.writes += 1;
        record.chunks.push(data);
        true
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }
}
