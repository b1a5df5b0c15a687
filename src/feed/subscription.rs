//! Long-poll and streaming change-feed actor.
//!
//! # Data Flow
//! ```text
//!                 ┌──────────────── one task per open feed ────────────────┐
//! db commits ───▶ │ broadcast::Receiver ─┐                                 │
//! heartbeat  ───▶ │ Interval ────────────┼─▶ select! ─▶ Response ─▶ writer │──▶ client
//! shutdown   ───▶ │ broadcast::Receiver ─┘   (biased)                      │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! # State Machine
//! ```text
//! longpoll:    Waiting ──(qualifying change)──▶ Flushing ──▶ Closed
//! continuous:  Streaming ──(change: line | tick: token)──▶ Streaming
//! any state ──(write failure | source closed | shutdown)──▶ Closed
//! ```
//!
//! # Design Decisions
//! - The task is the only writer of its Response, so writes never interleave
//! - Subscribing happens when the subscription is built, before any backlog
//!   query, and changes at or below the last delivered sequence are skipped
//! - Changes win over heartbeat ticks when both are ready
//! - Closing drops the change receiver and the timer, finishes the response
//!   and unregisters it; nothing else can write to it afterwards

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::feed::assemble::{results_body, FeedSource};
use crate::feed::mode::FeedMode;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::lifecycle::registry::{PendingResponses, Registration};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::store::{DatabaseChange, Sequence};

/// Why a feed ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Long-poll answered.
    Flushed,
    /// The client went away or the transport failed.
    WriteFailed,
    /// The database stopped publishing changes.
    SourceClosed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Flushed => "flushed",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::SourceClosed => "source_closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

enum FeedEvent {
    Change(Result<DatabaseChange, RecvError>),
    Heartbeat,
    Shutdown,
}

/// A `_changes` request that stays open.
pub struct ChangeSubscription {
    response: Response,
    source: FeedSource,
    changes: broadcast::Receiver<DatabaseChange>,
    last_seq: Sequence,
}

impl ChangeSubscription {
    /// Subscribe to the database now. Nothing committed after this call is missed.
    pub fn new(response: Response, source: FeedSource) -> Self {
        let changes = source.db().subscribe();
        let last_seq = source.options().since;
        Self {
            response,
            source,
            changes,
            last_seq,
        }
    }

    pub fn mode(&self) -> FeedMode {
        self.source.options().mode
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Give the response back, for handlers that can answer right away.
    pub fn into_response(self) -> Response {
        self.response
    }

    /// Attach the transport, register, and start the feed task.
    pub fn spawn(
        mut self,
        writer: Box<dyn ResponseWriter>,
        registry: &Arc<PendingResponses>,
        shutdown: &Shutdown,
    ) -> JoinHandle<()> {
        self.response.attach(writer);
        let registration = registry.register(self.mode().pending_kind(), self.source.db().name());
        let shutdown_rx = shutdown.subscribe();
        let already_stopping = shutdown.is_triggered();

        tracing::debug!(
            response_id = registration.id(),
            db = %self.source.db().name(),
            feed = %self.mode(),
            since = self.last_seq,
            "Change feed opened"
        );

        tokio::spawn(self.run(registration, shutdown_rx, already_stopping))
    }

    async fn run(
        mut self,
        mut registration: Registration,
        shutdown_rx: broadcast::Receiver<()>,
        already_stopping: bool,
    ) {
        let reason = self.drive(shutdown_rx, already_stopping).await;
        self.response.close();
        registration.finish();
        metrics::record_feed_closed(reason.as_str());
        tracing::debug!(
            response_id = registration.id(),
            feed = %self.mode(),
            reason = reason.as_str(),
            last_seq = self.last_seq,
            "Change feed closed"
        );
    }

    async fn drive(
        &mut self,
        shutdown_rx: broadcast::Receiver<()>,
        already_stopping: bool,
    ) -> CloseReason {
        let mode = self.mode();

        self.response.set_header("Content-Type", mode.content_type());
        // The body will report a later sequence than any tag set at request time.
        self.response.remove_header("Etag");
        if !self.response.set_chunked(true) || !self.response.write_headers() {
            return CloseReason::WriteFailed;
        }
        if already_stopping {
            return self.stop(CloseReason::Shutdown);
        }

        if mode.is_streaming() {
            let (rows, horizon) = self.source.catch_up(self.last_seq);
            for row in &rows {
                if !self.send_row(row) {
                    return CloseReason::WriteFailed;
                }
            }
            self.last_seq = horizon;
        }

        let mut heartbeat = self.source.options().heartbeat.map(heartbeat_timer);
        let mut shutdown_rx = Some(shutdown_rx);

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_signal(&mut shutdown_rx) => FeedEvent::Shutdown,
                change = self.changes.recv() => FeedEvent::Change(change),
                _ = next_tick(&mut heartbeat) => FeedEvent::Heartbeat,
            };

            let outcome = match event {
                FeedEvent::Change(Ok(change)) => self.on_change(&change),
                FeedEvent::Change(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, feed = %mode, "Change feed lagged, backfilling");
                    self.on_lag()
                }
                FeedEvent::Change(Err(RecvError::Closed)) => Some(self.stop(CloseReason::SourceClosed)),
                FeedEvent::Heartbeat => {
                    metrics::record_heartbeat();
                    let token = mode.heartbeat_token();
                    (!self.response.write_chunk(token, false)).then_some(CloseReason::WriteFailed)
                }
                FeedEvent::Shutdown => Some(self.stop(CloseReason::Shutdown)),
            };

            if let Some(reason) = outcome {
                return reason;
            }
        }
    }

    fn on_change(&mut self, change: &DatabaseChange) -> Option<CloseReason> {
        let seq = change.revision.sequence;
        if seq <= self.last_seq {
            return None;
        }

        if self.mode().is_streaming() {
            self.last_seq = seq;
            match self.source.row_for_change(change) {
                Some(row) if !self.send_row(&row) => Some(CloseReason::WriteFailed),
                _ => None,
            }
        } else {
            self.try_flush()
        }
    }

    fn on_lag(&mut self) -> Option<CloseReason> {
        if !self.mode().is_streaming() {
            return self.try_flush();
        }
        let (rows, horizon) = self.source.catch_up(self.last_seq);
        for row in &rows {
            if !self.send_row(row) {
                return Some(CloseReason::WriteFailed);
            }
        }
        self.last_seq = self.last_seq.max(horizon);
        None
    }

    /// Long-poll: re-query and answer with the first non-empty batch.
    fn try_flush(&mut self) -> Option<CloseReason> {
        let since = self.source.options().since;
        let (rows, last_seq) = self.source.collect(since);
        if rows.is_empty() {
            return None;
        }
        self.last_seq = last_seq;
        let count = rows.len();
        let body = results_body(rows, last_seq);
        metrics::record_feed_lines(self.mode().as_str(), count as u64);
        if self.response.write_chunk(body.to_string().into(), true) {
            Some(CloseReason::Flushed)
        } else {
            Some(CloseReason::WriteFailed)
        }
    }

    /// End without a qualifying change. A waiting long-poll still answers
    /// with a well-formed, empty result set.
    fn stop(&mut self, reason: CloseReason) -> CloseReason {
        if !self.mode().is_streaming() {
            let body = results_body(Vec::new(), self.last_seq);
            self.response.write_chunk(body.to_string().into(), true);
        }
        reason
    }

    fn send_row(&mut self, row: &serde_json::Value) -> bool {
        let mode = self.mode();
        let ok = self.response.write_chunk(mode.frame(row), false);
        if ok {
            metrics::record_feed_lines(mode.as_str(), 1);
        }
        ok
    }
}

fn heartbeat_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolve on shutdown. A dropped coordinator disables the branch.
async fn shutdown_signal(rx: &mut Option<broadcast::Receiver<()>>) {
    let closed = match rx.as_mut() {
        Some(rx) => matches!(rx.recv().await, Err(RecvError::Closed)),
        None => true,
    };
    if closed {
        *rx = None;
        std::future::pending::<()>().await;
    }
}
